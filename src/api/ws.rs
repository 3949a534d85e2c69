//! Dashboard websocket endpoint. Each socket gets an id and a bounded
//! outbound queue registered with the hub actor; the socket task here
//! only shuttles frames, all protocol decisions live in the hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::ApiState;
use crate::hub::{HubHandle, HubInput};
use crate::protocol::{DashboardMessage, HubToDashboard};

static NEXT_DASH_ID: AtomicU64 = AtomicU64::new(1);

/// Broadcast backlog a dashboard may accumulate before the hub drops
/// it from the roster.
const OUTBOUND_QUEUE: usize = 256;

/// Budget for one websocket frame. A dashboard that cannot take a
/// frame within it is treated as disconnected.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn dashboard_ws(
    State(state): State<ApiState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let dash_id = NEXT_DASH_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::channel::<HubToDashboard>(OUTBOUND_QUEUE);
    hub.send(HubInput::DashboardConnected {
        dash_id,
        outbound: out_tx,
    });

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else { break };
                let Ok(text) = serde_json::to_string(&msg) else { continue };
                match timeout(SEND_TIMEOUT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!("[ws] dashboard #{} send failed: {}", dash_id, err);
                        break;
                    }
                    Err(_) => {
                        warn!("[ws] dashboard #{} send timed out, dropping", dash_id);
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DashboardMessage>(&text) {
                            Ok(message) => hub.send(HubInput::DashboardMessage { dash_id, message }),
                            Err(err) => {
                                warn!("[ws] dashboard #{} sent malformed message: {}", dash_id, err);
                                let reply = HubToDashboard::Error {
                                    error: format!("malformed message: {}", err),
                                };
                                if let Ok(text) = serde_json::to_string(&reply) {
                                    let _ = timeout(SEND_TIMEOUT, sink.send(Message::Text(text))).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("[ws] dashboard #{} socket error: {}", dash_id, err);
                        break;
                    }
                }
            }
        }
    }

    hub.send(HubInput::DashboardDisconnected { dash_id });
    debug!("[ws] dashboard #{} closed", dash_id);
}
