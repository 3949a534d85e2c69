//! HTTP surface of the hub: a small REST API for dashboards and
//! scripts, a websocket endpoint carrying the live control protocol,
//! and static hosting for the dashboard frontend.

pub mod ws;

use std::path::PathBuf;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use log::info;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::hub::{HubHandle, HubSnapshot};
use crate::protocol::RecordingDescriptor;

#[derive(Clone)]
pub struct ApiState {
    pub hub: HubHandle,
    pub recordings_dir: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/recordings", get(recordings))
        .route("/api/recordings/:filename", get(download))
        .route("/ws", get(ws::dashboard_ws))
        .fallback_service(ServeDir::new("public"))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    bind: String,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding api server on {}", bind))?;
    info!("[api] serving dashboards on {}", bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("[api] server stopping");
        })
        .await
        .context("api server failed")
}

async fn status(State(state): State<ApiState>) -> Result<Json<HubSnapshot>, StatusCode> {
    state
        .hub
        .snapshot()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn recordings(
    State(state): State<ApiState>,
) -> Result<Json<Vec<RecordingDescriptor>>, StatusCode> {
    state
        .hub
        .recordings()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn download(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    // Catalog filenames are flat; anything path-like is an attempt to
    // escape the recordings directory.
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    let path = state.recordings_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let content_type = if filename.ends_with(".wav") {
        "audio/wav"
    } else if filename.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}
