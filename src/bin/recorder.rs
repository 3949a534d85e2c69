use anyhow::Context;
use env_logger::Env;
use log::info;
use tokio::sync::watch;

use fieldrec::capture::{self, pipeline::CapturePipeline};
use fieldrec::client::RecorderClient;
use fieldrec::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!(
        "[recorder] loaded config from {} (client_id '{}')",
        config_path, config.client.client_id
    );

    let source = capture::default_source(&config.capture);
    info!("[recorder] capture source: {}", source.name());
    let (pipeline, events_rx) =
        CapturePipeline::open(source, config.capture.clone(), &config.client.client_id)
            .context("opening capture pipeline")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("[recorder] shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .context("installing signal handler")?;

    let client = RecorderClient::new(config.client.clone(), pipeline, events_rx, shutdown_rx);
    client.run().await?;
    info!("[recorder] bye");
    Ok(())
}
