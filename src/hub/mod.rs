//! Central hub: one actor task owns the connection registry, command
//! routing and the recordings catalog. Connection tasks never touch
//! shared state directly; everything funnels through [`HubInput`] so
//! registry updates are serialized without locks.

pub mod catalog;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::config::HubConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{
    ClientMessage, CommandVerb, DashboardMessage, EventKind, HubToClient, HubToDashboard,
    RecorderStatus, RecordingDescriptor,
};

/// Dashboard shorthand addressing every connected recorder at once.
pub const BROADCAST_ID: &str = "all";

/// Per-recorder outbound queue depth. A recorder that cannot drain
/// this many commands is stalled; further sends fail fast instead of
/// blocking the actor.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug)]
pub enum HubInput {
    RecorderConnected {
        client_id: String,
        conn_seq: u64,
        outbound: mpsc::Sender<HubToClient>,
    },
    RecorderMessage {
        client_id: String,
        conn_seq: u64,
        message: ClientMessage,
    },
    RecorderDisconnected {
        client_id: String,
        conn_seq: u64,
    },
    DashboardConnected {
        dash_id: u64,
        outbound: mpsc::Sender<HubToDashboard>,
    },
    DashboardMessage {
        dash_id: u64,
        message: DashboardMessage,
    },
    DashboardDisconnected {
        dash_id: u64,
    },
    CatalogScanned {
        recordings: Vec<RecordingDescriptor>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    Recordings {
        reply: oneshot::Sender<Vec<RecordingDescriptor>>,
    },
}

/// REST-facing view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderSummary {
    pub client_id: String,
    pub recording: bool,
    pub status: Option<RecorderStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub recorders: Vec<RecorderSummary>,
    pub recordings: usize,
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubInput>,
}

impl HubHandle {
    pub fn send(&self, input: HubInput) {
        // Failure means the hub actor is gone, i.e. we are shutting
        // down; connection tasks just wind down on their own.
        let _ = self.tx.send(input);
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(HubInput::Snapshot { reply });
        rx.await.ok()
    }

    pub async fn recordings(&self) -> Option<Vec<RecordingDescriptor>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubInput::Recordings { reply });
        rx.await.ok()
    }
}

struct ConnectionRecord {
    conn_seq: u64,
    outbound: mpsc::Sender<HubToClient>,
    status: Option<RecorderStatus>,
}

pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubInput>,
    handle: HubHandle,
    recorders: HashMap<String, ConnectionRecord>,
    dashboards: HashMap<u64, mpsc::Sender<HubToDashboard>>,
    recordings: Vec<RecordingDescriptor>,
    recordings_dir: PathBuf,
    scan_in_flight: bool,
    rescan_wanted: bool,
}

impl Hub {
    pub fn new(recordings_dir: PathBuf) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = HubHandle { tx };
        let hub = Self {
            rx,
            handle: handle.clone(),
            recorders: HashMap::new(),
            dashboards: HashMap::new(),
            recordings: Vec::new(),
            recordings_dir,
            scan_in_flight: false,
            rescan_wanted: false,
        };
        (hub, handle)
    }

    pub async fn run(mut self) {
        self.request_rescan();
        while let Some(input) = self.rx.recv().await {
            self.handle_input(input);
        }
        debug!("[hub] actor stopped");
    }

    fn handle_input(&mut self, input: HubInput) {
        match input {
            HubInput::RecorderConnected {
                client_id,
                conn_seq,
                outbound,
            } => self.recorder_connected(client_id, conn_seq, outbound),
            HubInput::RecorderMessage {
                client_id,
                conn_seq,
                message,
            } => self.recorder_message(client_id, conn_seq, message),
            HubInput::RecorderDisconnected { client_id, conn_seq } => {
                self.recorder_disconnected(client_id, conn_seq)
            }
            HubInput::DashboardConnected { dash_id, outbound } => {
                self.dashboard_connected(dash_id, outbound)
            }
            HubInput::DashboardMessage { dash_id, message } => {
                self.dashboard_message(dash_id, message)
            }
            HubInput::DashboardDisconnected { dash_id } => {
                self.dashboards.remove(&dash_id);
                debug!("[hub] dashboard #{} disconnected", dash_id);
            }
            HubInput::CatalogScanned { recordings } => self.catalog_scanned(recordings),
            HubInput::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HubInput::Recordings { reply } => {
                let _ = reply.send(self.recordings.clone());
            }
        }
    }

    fn recorder_connected(
        &mut self,
        client_id: String,
        conn_seq: u64,
        outbound: mpsc::Sender<HubToClient>,
    ) {
        let record = ConnectionRecord {
            conn_seq,
            outbound,
            status: None,
        };
        // Re-registration under the same id replaces the old
        // connection; dropping its sender ends the stale writer task.
        if self.recorders.insert(client_id.clone(), record).is_some() {
            info!("[hub] recorder '{}' re-registered, replacing old connection", client_id);
        } else {
            info!("[hub] recorder '{}' connected", client_id);
        }
        self.broadcast(HubToDashboard::RecorderConnected { client_id });
    }

    fn recorder_disconnected(&mut self, client_id: String, conn_seq: u64) {
        // A replaced connection reports its disconnect after the new
        // one registered; the sequence number keeps it from evicting
        // the live record.
        let current = self.recorders.get(&client_id).map(|r| r.conn_seq);
        if current != Some(conn_seq) {
            debug!(
                "[hub] ignoring stale disconnect for '{}' (conn #{})",
                client_id, conn_seq
            );
            return;
        }
        self.recorders.remove(&client_id);
        info!("[hub] recorder '{}' disconnected", client_id);
        self.broadcast(HubToDashboard::RecorderDisconnected { client_id });
    }

    fn recorder_message(&mut self, client_id: String, conn_seq: u64, message: ClientMessage) {
        let live = self
            .recorders
            .get(&client_id)
            .is_some_and(|r| r.conn_seq == conn_seq);
        if !live {
            debug!("[hub] dropping message from stale connection '{}'", client_id);
            return;
        }

        match message {
            ClientMessage::Register { .. } => {
                warn!("[hub] duplicate register from '{}'", client_id);
            }
            ClientMessage::Status { status, .. } => {
                if let Some(record) = self.recorders.get_mut(&client_id) {
                    record.status = Some(status.clone());
                }
                self.broadcast(HubToDashboard::RecorderStatus { client_id, status });
            }
            ClientMessage::Event {
                kind,
                mut data,
                timestamp,
                ..
            } => {
                if let Value::Object(map) = &mut data {
                    map.insert("client_id".to_string(), json!(client_id));
                    map.insert("timestamp".to_string(), json!(timestamp));
                }
                info!("[hub] event '{}' from '{}'", kind.as_str(), client_id);
                self.broadcast(HubToDashboard::from_event(kind, data));
                if matches!(kind, EventKind::RecordingCompleted | EventKind::RecordingStopped) {
                    self.request_rescan();
                }
            }
            ClientMessage::Error { error, .. } => {
                warn!("[hub] recorder '{}' error: {}", client_id, error);
                self.broadcast(HubToDashboard::RecorderError { client_id, error });
            }
        }
    }

    fn dashboard_connected(&mut self, dash_id: u64, outbound: mpsc::Sender<HubToDashboard>) {
        let _ = outbound.try_send(self.initial_state());
        self.dashboards.insert(dash_id, outbound);
        info!("[hub] dashboard #{} connected", dash_id);
    }

    fn dashboard_message(&mut self, dash_id: u64, message: DashboardMessage) {
        match message {
            DashboardMessage::Command {
                client_id,
                command,
                payload,
            } => self.dispatch_command(dash_id, client_id, command, payload),
            DashboardMessage::GetRecordings => {
                self.send_to_dashboard(
                    dash_id,
                    HubToDashboard::RecordingsUpdated {
                        recordings: self.recordings.clone(),
                    },
                );
            }
            DashboardMessage::RefreshRecorders => {
                // Poke every recorder for a fresh status push and hand
                // the requester the registry as it stands right now.
                for (id, record) in &self.recorders {
                    let cmd = HubToClient::Command {
                        command: CommandVerb::GetStatus,
                        payload: Value::Null,
                    };
                    if record.outbound.try_send(cmd).is_err() {
                        debug!("[hub] refresh: could not reach '{}'", id);
                    }
                }
                self.send_to_dashboard(dash_id, self.initial_state());
            }
        }
    }

    fn dispatch_command(
        &mut self,
        dash_id: u64,
        client_id: String,
        command: CommandVerb,
        payload: Value,
    ) {
        let cmd = HubToClient::Command { command, payload };

        if client_id == BROADCAST_ID {
            let mut delivered = 0usize;
            let mut failed = Vec::new();
            for (id, record) in &self.recorders {
                if record.outbound.try_send(cmd.clone()).is_ok() {
                    delivered += 1;
                } else {
                    // One stalled recorder never blocks the rest of
                    // the fan-out.
                    warn!("[hub] fan-out to '{}' failed", id);
                    failed.push(id.clone());
                }
            }
            info!(
                "[hub] fan-out '{}' delivered to {}/{} recorders",
                command.as_str(),
                delivered,
                delivered + failed.len()
            );
            self.send_to_dashboard(
                dash_id,
                HubToDashboard::CommandResponse {
                    client_id: BROADCAST_ID.to_string(),
                    response: json!({
                        "command": command.as_str(),
                        "delivered": delivered,
                        "failed": failed,
                    }),
                },
            );
            return;
        }

        let Some(record) = self.recorders.get(&client_id) else {
            self.send_to_dashboard(
                dash_id,
                HubToDashboard::Error {
                    error: format!("unknown recorder '{}'", client_id),
                },
            );
            return;
        };

        match record.outbound.try_send(cmd) {
            Ok(()) => {
                self.send_to_dashboard(
                    dash_id,
                    HubToDashboard::CommandResponse {
                        client_id,
                        response: json!({ "command": command.as_str(), "queued": true }),
                    },
                );
            }
            Err(err) => {
                warn!("[hub] command to '{}' failed: {}", client_id, err);
                self.send_to_dashboard(
                    dash_id,
                    HubToDashboard::Error {
                        error: format!("recorder '{}' unreachable", client_id),
                    },
                );
            }
        }
    }

    fn request_rescan(&mut self) {
        if self.scan_in_flight {
            self.rescan_wanted = true;
            return;
        }
        self.scan_in_flight = true;
        let dir = self.recordings_dir.clone();
        let handle = self.handle.clone();
        tokio::task::spawn_blocking(move || {
            let recordings = catalog::scan(&dir);
            handle.send(HubInput::CatalogScanned { recordings });
        });
    }

    fn catalog_scanned(&mut self, recordings: Vec<RecordingDescriptor>) {
        debug!("[hub] catalog scan found {} recordings", recordings.len());
        self.recordings = recordings;
        self.scan_in_flight = false;
        self.broadcast(HubToDashboard::RecordingsUpdated {
            recordings: self.recordings.clone(),
        });
        if self.rescan_wanted {
            self.rescan_wanted = false;
            self.request_rescan();
        }
    }

    fn initial_state(&self) -> HubToDashboard {
        let recorders = self
            .recorders
            .iter()
            .filter_map(|(id, record)| record.status.clone().map(|s| (id.clone(), s)))
            .collect();
        HubToDashboard::InitialState {
            recorders,
            recordings: self.recordings.clone(),
        }
    }

    fn snapshot(&mut self) -> HubSnapshot {
        let mut recorders: Vec<RecorderSummary> = self
            .recorders
            .iter()
            .map(|(id, record)| RecorderSummary {
                client_id: id.clone(),
                recording: record.status.as_ref().is_some_and(|s| s.recording),
                status: record.status.clone(),
            })
            .collect();
        recorders.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        HubSnapshot {
            recorders,
            recordings: self.recordings.len(),
        }
    }

    // A dashboard that cannot keep up with its bounded queue is
    // dropped from the roster; its socket task notices the closed
    // channel and ends the connection.
    fn send_to_dashboard(&mut self, dash_id: u64, msg: HubToDashboard) {
        if let Some(tx) = self.dashboards.get(&dash_id) {
            if tx.try_send(msg).is_err() {
                warn!("[hub] dashboard #{} unresponsive, dropping", dash_id);
                self.dashboards.remove(&dash_id);
            }
        }
    }

    fn broadcast(&mut self, msg: HubToDashboard) {
        let mut stale = Vec::new();
        for (dash_id, tx) in &self.dashboards {
            if tx.try_send(msg.clone()).is_err() {
                stale.push(*dash_id);
            }
        }
        for dash_id in stale {
            warn!("[hub] dashboard #{} unresponsive, dropping", dash_id);
            self.dashboards.remove(&dash_id);
        }
    }
}

/// Accept loop for recorder control connections.
pub async fn run_client_listener(
    cfg: HubConfig,
    handle: HubHandle,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.client_bind)
        .await
        .with_context(|| format!("binding recorder listener on {}", cfg.client_bind))?;
    info!("[hub] listening for recorders on {}", cfg.client_bind);
    serve_listener(listener, cfg, handle, shutdown).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    cfg: HubConfig,
    handle: HubHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut next_seq: u64 = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting recorder connection")?;
                debug!("[hub] recorder connection from {}", peer);
                let conn_seq = next_seq;
                next_seq += 1;
                tokio::spawn(serve_recorder(stream, conn_seq, cfg.clone(), handle.clone()));
            }
            _ = shutdown.changed() => {
                info!("[hub] recorder listener stopping");
                return Ok(());
            }
        }
    }
}

async fn serve_recorder(
    stream: tokio::net::TcpStream,
    conn_seq: u64,
    cfg: HubConfig,
    handle: HubHandle,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let send_budget = Duration::from_millis(cfg.send_timeout_ms);

    // The very first line must be a register; anything else ends the
    // connection with an explicit error.
    let handshake = Duration::from_millis(cfg.handshake_timeout_ms);
    let client_id = match timeout(handshake, lines.next_line()).await {
        Ok(Ok(Some(line))) => match serde_json::from_str::<ClientMessage>(&line) {
            Ok(ClientMessage::Register { client_id })
                if !client_id.is_empty() && client_id != BROADCAST_ID =>
            {
                client_id
            }
            Ok(_) => {
                reject(&mut write_half, ProtocolError::RegisterExpected, send_budget).await;
                return;
            }
            Err(err) => {
                reject(&mut write_half, ProtocolError::Malformed(err), send_budget).await;
                return;
            }
        },
        Ok(Ok(None)) | Ok(Err(_)) => return,
        Err(_) => {
            warn!("[hub] connection #{} timed out before registering", conn_seq);
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<HubToClient>(OUTBOUND_QUEUE);
    handle.send(HubInput::RecorderConnected {
        client_id: client_id.clone(),
        conn_seq,
        outbound: out_tx,
    });

    // One loop shuttles both directions. A write that errors or
    // exceeds the budget is a disconnect for this peer, even while the
    // socket is still readable: a wedged recorder must not linger in
    // the registry. The actor dropping our sender (re-registration or
    // eviction) also ends the connection.
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else { break };
                if push_line(&mut write_half, &msg, send_budget).await.is_err() {
                    warn!("[hub] push to '{}' failed, dropping connection", client_id);
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match serde_json::from_str::<ClientMessage>(&line) {
                        Ok(message) => handle.send(HubInput::RecorderMessage {
                            client_id: client_id.clone(),
                            conn_seq,
                            message,
                        }),
                        Err(err) => {
                            warn!("[hub] malformed message from '{}': {}", client_id, err);
                            let reply = HubToClient::Error {
                                error: ProtocolError::Malformed(err).to_string(),
                            };
                            if push_line(&mut write_half, &reply, send_budget).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!("[hub] read error from '{}': {}", client_id, err);
                        break;
                    }
                }
            }
        }
    }

    handle.send(HubInput::RecorderDisconnected {
        client_id,
        conn_seq,
    });
}

async fn push_line(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    msg: &HubToClient,
    budget: Duration,
) -> Result<(), TransportError> {
    let mut line = serde_json::to_string(msg).map_err(|err| {
        TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })?;
    line.push('\n');
    match timeout(budget, write_half.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) => Err(TransportError::SendTimeout),
    }
}

async fn reject(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    error: ProtocolError,
    budget: Duration,
) {
    let msg = HubToClient::Error {
        error: error.to_string(),
    };
    let _ = push_line(write_half, &msg, budget).await;
}
