//! Recorder client: owns one capture pipeline, speaks the control
//! protocol to the hub and keeps the two strictly independent. Losing
//! the control connection never interrupts an in-flight recording; the
//! client reconnects with backoff and re-registers under the same id.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::capture::pipeline::{CapturePipeline, PipelineEvent, PipelineEventKind};
use crate::capture::{self, SUPPORTED_CHANNELS, SUPPORTED_SAMPLERATES};
use crate::config::ClientConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{
    ClientMessage, CommandVerb, EventKind, HubToClient, RecorderStatus, StatusConfig,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FINAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
struct StartPayload {
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigUpdate {
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    samplerate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
}

enum SessionEnd {
    /// Transport died; reconnect with backoff.
    Disconnected,
    /// Shutdown command or local signal; terminate the process.
    Shutdown,
}

pub struct RecorderClient {
    cfg: ClientConfig,
    pipeline: CapturePipeline,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    shutdown_rx: watch::Receiver<bool>,
    shutting_down: bool,
}

impl RecorderClient {
    pub fn new(
        cfg: ClientConfig,
        pipeline: CapturePipeline,
        events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            pipeline,
            events_rx,
            shutdown_rx,
            shutting_down: false,
        }
    }

    /// Connect/re-register loop. Returns once a shutdown command or
    /// local signal has been honored.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let initial = Duration::from_millis(self.cfg.reconnect_initial_ms);
        let max = Duration::from_millis(self.cfg.reconnect_max_ms);
        let mut backoff = initial;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.connect().await {
                Ok(stream) => {
                    backoff = initial;
                    match self.session(stream).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Disconnected) => {
                            warn!("[client] connection to hub lost");
                        }
                        Err(err) => {
                            warn!("[client] session failed: {}", err);
                        }
                    }
                }
                Err(err) => {
                    warn!("[client] {}", err);
                }
            }

            if *self.shutdown_rx.borrow() || self.shutting_down {
                break;
            }

            // Recording (if any) continues untouched while we wait.
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            let wait = backoff + Duration::from_millis(jitter);
            info!("[client] reconnecting in {:.1}s", wait.as_secs_f64());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown_rx.changed() => break,
            }
            backoff = (backoff * 2).min(max);
        }

        self.finish().await;
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = self.cfg.hub_addr.clone();
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("[client] connected to hub at {}", addr);
                Ok(stream)
            }
            Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
            Err(_) => Err(TransportError::HandshakeTimeout),
        }
    }

    async fn session(&mut self, stream: TcpStream) -> Result<SessionEnd, TransportError> {
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        self.send(
            &mut writer,
            &ClientMessage::Register {
                client_id: self.cfg.client_id.clone(),
            },
        )
        .await?;
        self.send_status(&mut writer).await?;
        info!("[client] registered as '{}'", self.cfg.client_id);

        // Terminal events that fired while we were disconnected are
        // still queued; deliver them before processing new input.
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_pipeline_event(event, &mut writer).await?;
        }

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(end) = self.handle_line(&line, &mut writer).await? {
                                return Ok(end);
                            }
                        }
                        Ok(None) => return Ok(SessionEnd::Disconnected),
                        Err(err) => {
                            warn!("[client] read error: {}", err);
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return Ok(SessionEnd::Disconnected);
                    };
                    self.handle_pipeline_event(event, &mut writer).await?;
                    if self.shutting_down && !self.pipeline.is_recording() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if self.begin_shutdown() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    // Keep the session open until the stop completes so
                    // the hub still receives the terminal event.
                }
            }
        }
    }

    async fn handle_line(
        &mut self,
        line: &str,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Option<SessionEnd>, TransportError> {
        let msg: HubToClient = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("[client] malformed message from hub: {}", err);
                self.send_error(writer, format!("malformed message: {}", err))
                    .await?;
                return Ok(None);
            }
        };

        match msg {
            HubToClient::Command { command, payload } => {
                debug!("[client] received command '{}'", command.as_str());
                self.handle_command(command, payload, writer).await
            }
            HubToClient::Error { error } => {
                warn!("[client] hub reported error: {}", error);
                Ok(None)
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: CommandVerb,
        payload: Value,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Option<SessionEnd>, TransportError> {
        match command {
            CommandVerb::StartRecording => {
                self.start_recording(payload, writer).await?;
            }
            CommandVerb::StopRecording => {
                if self.pipeline.stop().is_err() {
                    // Nothing to do is success, not failure: report the
                    // (idle) state instead of an error.
                    debug!("[client] stop_recording with no active session");
                    self.send_status(writer).await?;
                }
            }
            CommandVerb::GetStatus | CommandVerb::ListDevices => {
                self.send_status(writer).await?;
            }
            CommandVerb::UpdateConfig => {
                self.update_config(payload, writer).await?;
            }
            CommandVerb::Shutdown => {
                info!("[client] shutdown command received");
                if self.begin_shutdown() {
                    return Ok(Some(SessionEnd::Shutdown));
                }
            }
        }
        Ok(None)
    }

    async fn start_recording(
        &mut self,
        payload: Value,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), TransportError> {
        let payload: StartPayload = if payload.is_null() {
            StartPayload::default()
        } else {
            match serde_json::from_value(payload) {
                Ok(payload) => payload,
                Err(err) => {
                    return self
                        .send_error(writer, format!("invalid start_recording payload: {}", err))
                        .await;
                }
            }
        };

        if let Some(duration) = payload.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return self
                    .send_error(writer, format!("invalid duration: {}", duration))
                    .await;
            }
        }

        if self.pipeline.is_recording() {
            let err = ProtocolError::OutOfState {
                command: CommandVerb::StartRecording.as_str().to_string(),
                reason: "already recording".to_string(),
            };
            return self.send_error(writer, err.to_string()).await;
        }

        let filename = payload
            .filename
            .filter(|name| !name.is_empty() && !name.contains('/') && !name.contains(".."))
            .unwrap_or_else(|| {
                format!(
                    "recording_{}_{}.wav",
                    Utc::now().format("%Y%m%d_%H%M%S"),
                    self.cfg.client_id
                )
            });
        let output_path = PathBuf::from(&self.cfg.output_dir).join(&filename);
        let session_id = format!("{}-{}", self.cfg.client_id, Utc::now().timestamp_millis());

        if let Err(err) = self
            .pipeline
            .start(&session_id, payload.duration, output_path)
        {
            warn!("[client] start_recording failed: {}", err);
            self.send_event(
                writer,
                EventKind::RecordingError,
                json!({ "error": err.to_string() }),
            )
            .await?;
            return Ok(());
        }

        self.send_event(
            writer,
            EventKind::RecordingStarted,
            json!({
                "session_id": session_id,
                "filename": filename,
                "duration": payload.duration,
            }),
        )
        .await?;
        self.send_status(writer).await
    }

    async fn update_config(
        &mut self,
        payload: Value,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), TransportError> {
        if self.pipeline.is_recording() {
            let err = ProtocolError::OutOfState {
                command: CommandVerb::UpdateConfig.as_str().to_string(),
                reason: "a capture session is active".to_string(),
            };
            return self.send_error(writer, err.to_string()).await;
        }

        let update: ConfigUpdate = match serde_json::from_value(payload) {
            Ok(update) => update,
            Err(err) => {
                return self
                    .send_error(writer, format!("invalid update_config payload: {}", err))
                    .await;
            }
        };

        let mut config = self.pipeline.config().clone();
        if let Some(samplerate) = update.samplerate {
            if !SUPPORTED_SAMPLERATES.contains(&samplerate) {
                return self
                    .send_error(writer, format!("unsupported samplerate {}", samplerate))
                    .await;
            }
            config.samplerate = samplerate;
        }
        if let Some(channels) = update.channels {
            if !SUPPORTED_CHANNELS.contains(&channels) {
                return self
                    .send_error(writer, format!("unsupported channel count {}", channels))
                    .await;
            }
            config.channels = channels;
        }
        if let Some(device) = update.device {
            config.device = device;
        }

        match self.pipeline.set_config(config) {
            Ok(()) => {
                info!("[client] capture config updated");
                self.send_status(writer).await
            }
            Err(err) => self.send_error(writer, err.to_string()).await,
        }
    }

    async fn handle_pipeline_event(
        &mut self,
        event: PipelineEvent,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), TransportError> {
        let filename = event
            .output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (kind, data) = match event.kind {
            PipelineEventKind::Completed => (
                EventKind::RecordingCompleted,
                json!({
                    "session_id": event.session_id,
                    "filename": filename,
                    "metadata": event.metadata,
                }),
            ),
            PipelineEventKind::Stopped => (
                EventKind::RecordingStopped,
                json!({
                    "session_id": event.session_id,
                    "filename": filename,
                    "metadata": event.metadata,
                }),
            ),
            PipelineEventKind::Failed(error) => (
                EventKind::RecordingError,
                json!({
                    "session_id": event.session_id,
                    "filename": filename,
                    "error": error,
                }),
            ),
        };

        self.send_event(writer, kind, data).await?;
        self.send_status(writer).await
    }

    /// Start graceful shutdown. Returns true when the process can exit
    /// right away (no session to wind down).
    fn begin_shutdown(&mut self) -> bool {
        self.shutting_down = true;
        if self.pipeline.is_recording() {
            if let Err(err) = self.pipeline.stop() {
                warn!("[client] shutdown stop failed: {}", err);
                return true;
            }
            false
        } else {
            true
        }
    }

    /// Wind down an in-flight session when exiting without a hub
    /// connection to report to.
    async fn finish(&mut self) {
        if !self.pipeline.is_recording() {
            return;
        }
        info!("[client] stopping active session before exit");
        if self.pipeline.stop().is_err() {
            return;
        }
        match timeout(FINAL_DRAIN_TIMEOUT, self.events_rx.recv()).await {
            Ok(Some(event)) => {
                info!(
                    "[client] session '{}' closed during shutdown",
                    event.session_id
                );
            }
            _ => warn!("[client] session did not close within shutdown budget"),
        }
    }

    fn status(&mut self) -> RecorderStatus {
        let config = self.pipeline.config();
        let status_config = StatusConfig {
            device: config.device.clone(),
            samplerate: config.samplerate,
            channels: config.channels,
        };
        let capabilities = capture::capabilities(self.pipeline.source());
        RecorderStatus {
            recording: self.pipeline.is_recording(),
            config: status_config,
            capabilities,
        }
    }

    async fn send_status(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), TransportError> {
        let msg = ClientMessage::Status {
            client_id: self.cfg.client_id.clone(),
            status: self.status(),
        };
        self.send(writer, &msg).await
    }

    async fn send_event(
        &mut self,
        writer: &mut OwnedWriteHalf,
        kind: EventKind,
        data: Value,
    ) -> Result<(), TransportError> {
        let msg = ClientMessage::Event {
            client_id: self.cfg.client_id.clone(),
            kind,
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.send(writer, &msg).await
    }

    async fn send_error(
        &mut self,
        writer: &mut OwnedWriteHalf,
        error: String,
    ) -> Result<(), TransportError> {
        warn!("[client] rejecting command: {}", error);
        let msg = ClientMessage::Error {
            client_id: self.cfg.client_id.clone(),
            error,
        };
        self.send(writer, &msg).await
    }

    async fn send(
        &self,
        writer: &mut OwnedWriteHalf,
        msg: &ClientMessage,
    ) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(msg).map_err(|err| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        line.push('\n');

        let budget = Duration::from_millis(self.cfg.send_timeout_ms);
        match timeout(budget, writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Err(_) => Err(TransportError::SendTimeout),
        }
    }
}
