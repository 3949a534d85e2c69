use std::path::PathBuf;

use anyhow::Context;
use env_logger::Env;
use log::info;
use tokio::sync::watch;

use fieldrec::api::{self, ApiState};
use fieldrec::config::Config;
use fieldrec::hub::{Hub, run_client_listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!("[hub] loaded config from {}", config_path);

    let recordings_dir = PathBuf::from(&config.hub.recordings_dir);
    std::fs::create_dir_all(&recordings_dir)
        .with_context(|| format!("creating recordings dir {}", recordings_dir.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("[hub] shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .context("installing signal handler")?;

    let (hub, handle) = Hub::new(recordings_dir.clone());
    let actor = tokio::spawn(hub.run());

    let listener = tokio::spawn(run_client_listener(
        config.hub.clone(),
        handle.clone(),
        shutdown_rx.clone(),
    ));

    let state = ApiState {
        hub: handle,
        recordings_dir,
    };
    api::serve(config.hub.api_bind.clone(), state, shutdown_rx).await?;

    if let Ok(Err(err)) = listener.await {
        log::warn!("[hub] recorder listener failed: {}", err);
    }
    actor.abort();
    info!("[hub] bye");
    Ok(())
}
