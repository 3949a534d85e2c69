//! Producer/consumer bridge between a capture source and a durable
//! file.
//!
//! The source callback pushes blocks into a bounded queue with
//! `try_send`; when the queue is full the block is dropped and counted
//! instead of stalling the hardware thread. A single writer thread
//! drains the queue strictly in arrival order into a WAV file, honors
//! only the first close request per session, drains the remainder on a
//! clean close, flushes the sidecar metadata and emits exactly one
//! terminal event to the owner.

use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TrySendError};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::capture::{CaptureSource, SourceEvent, SourceHandle};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, DeviceError};
use crate::protocol::SidecarMetadata;

const IDLE_RECV_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum PipelineEventKind {
    /// Duration expiry: the session ran to its target.
    Completed,
    /// Explicit stop before expiry.
    Stopped,
    /// Device or write failure; the file is left as-is on disk.
    Failed(String),
}

#[derive(Debug)]
pub struct PipelineEvent {
    pub session_id: String,
    pub kind: PipelineEventKind,
    pub output_path: PathBuf,
    pub metadata: Option<SidecarMetadata>,
}

struct ActiveSession {
    session_id: String,
    stop_requested: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

pub struct CapturePipeline {
    source: Box<dyn CaptureSource>,
    config: CaptureConfig,
    client_id: String,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    active: Option<ActiveSession>,
}

impl CapturePipeline {
    /// Build a pipeline around a source. Events for every terminal
    /// session outcome arrive on the returned receiver.
    pub fn open(
        source: Box<dyn CaptureSource>,
        config: CaptureConfig,
        client_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PipelineEvent>), DeviceError> {
        // Surface empty-block misconfiguration here rather than as a
        // writer fault mid-session.
        if config.block_samples() == 0 {
            return Err(DeviceError::unavailable(
                &config.device,
                "capture config yields empty blocks",
            ));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                source,
                config,
                client_id: client_id.to_string(),
                events_tx,
                active: None,
            },
            events_rx,
        ))
    }

    pub fn source(&self) -> &dyn CaptureSource {
        self.source.as_ref()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }
        self.config = config;
        Ok(())
    }

    /// True while a session's writer is alive. Finished sessions are
    /// reaped here so a new start is possible as soon as the previous
    /// writer exits, even before its event is consumed.
    pub fn is_recording(&mut self) -> bool {
        if let Some(session) = &self.active {
            if session.writer.is_finished() {
                self.active = None;
            }
        }
        self.active.is_some()
    }

    pub fn start(
        &mut self,
        session_id: &str,
        target_duration: Option<f64>,
        output_path: PathBuf,
    ) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }

        if let Some(dir) = output_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let spec = WavSpec {
            channels: self.config.channels,
            sample_rate: self.config.samplerate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let wav = WavWriter::create(&output_path, spec)?;

        let (tx, rx) = channel::bounded::<SourceEvent>(self.config.queue_blocks);
        let dropped = Arc::new(AtomicU64::new(0));

        let producer_dropped = dropped.clone();
        let handle = self.source.open(
            &self.config,
            Box::new(move |event| match event {
                SourceEvent::Block(_) => {
                    if let Err(TrySendError::Full(_)) = tx.try_send(event) {
                        producer_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // A fault must reach the writer even when the queue is
                // full; the producer thread is exiting anyway.
                SourceEvent::Fault(_) => {
                    let _ = tx.send(event);
                }
            }),
        )?;

        let stop_requested = Arc::new(AtomicBool::new(false));
        let target_frames =
            target_duration.map(|secs| (secs * self.config.samplerate as f64).round() as u64);

        let writer = WriterTask {
            session_id: session_id.to_string(),
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            output_path,
            target_frames,
            stop_requested: stop_requested.clone(),
            dropped,
            events_tx: self.events_tx.clone(),
        };

        let join = thread::spawn(move || writer.run(wav, rx, handle));

        info!(
            "[pipeline] session '{}' started ({}Hz, {}ch{})",
            session_id,
            self.config.samplerate,
            self.config.channels,
            match target_duration {
                Some(secs) => format!(", {}s", secs),
                None => String::new(),
            }
        );

        self.active = Some(ActiveSession {
            session_id: session_id.to_string(),
            stop_requested,
            writer: join,
        });
        Ok(())
    }

    /// Request a close. Only the first close request per session takes
    /// effect; a stop racing a duration expiry is resolved by the
    /// writer thread, which closes exactly once either way.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.is_recording() {
            return Err(CaptureError::NoActiveSession);
        }
        let session = self.active.as_ref().expect("checked by is_recording");
        session.stop_requested.store(true, Ordering::SeqCst);
        info!("[pipeline] stop requested for session '{}'", session.session_id);
        Ok(())
    }
}

enum CloseReason {
    Stop,
    Expired,
    Fault(String),
}

struct WriterTask {
    session_id: String,
    client_id: String,
    config: CaptureConfig,
    output_path: PathBuf,
    target_frames: Option<u64>,
    stop_requested: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl WriterTask {
    fn run(
        self,
        mut wav: WavWriter<BufWriter<fs::File>>,
        rx: Receiver<SourceEvent>,
        handle: SourceHandle,
    ) {
        let started_at = Utc::now();
        let mut frames_written: u64 = 0;
        let reason;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                reason = CloseReason::Stop;
                break;
            }
            if let Some(target) = self.target_frames {
                if frames_written >= target {
                    reason = CloseReason::Expired;
                    break;
                }
            }

            match rx.recv_timeout(IDLE_RECV_TIMEOUT) {
                Ok(SourceEvent::Block(block)) => {
                    match write_block(&mut wav, &block.samples, self.config.channels) {
                        Ok(frames) => frames_written += frames,
                        Err(err) => {
                            reason = CloseReason::Fault(err.to_string());
                            break;
                        }
                    }
                }
                Ok(SourceEvent::Fault(message)) => {
                    reason = CloseReason::Fault(message);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    reason = CloseReason::Fault("capture source went away".to_string());
                    break;
                }
            }
        }

        // Stop production before draining: close() joins the producer
        // thread, so afterwards the queue can no longer grow.
        handle.close();

        if matches!(reason, CloseReason::Stop | CloseReason::Expired) {
            while let Ok(event) = rx.try_recv() {
                if let SourceEvent::Block(block) = event {
                    match write_block(&mut wav, &block.samples, self.config.channels) {
                        Ok(frames) => frames_written += frames,
                        Err(err) => {
                            warn!("[pipeline] drain write failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        if let Err(err) = wav.finalize() {
            warn!("[pipeline] wav finalize failed: {}", err);
        }

        let dropped_blocks = self.dropped.load(Ordering::Relaxed);
        let duration = frames_written as f64 / self.config.samplerate as f64;

        let (kind, metadata) = match reason {
            CloseReason::Fault(message) => {
                warn!(
                    "[pipeline] session '{}' failed after {:.2}s: {}",
                    self.session_id, duration, message
                );
                (PipelineEventKind::Failed(message), None)
            }
            clean => {
                let metadata = SidecarMetadata {
                    client_id: self.client_id.clone(),
                    device: self.config.device.clone(),
                    samplerate: self.config.samplerate,
                    channels: self.config.channels,
                    started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    duration,
                    total_frames: frames_written,
                    dropped_blocks,
                };
                self.write_sidecar(&metadata);

                info!(
                    "[pipeline] session '{}' closed: {:.2}s, {} frames, {} dropped blocks",
                    self.session_id, duration, frames_written, dropped_blocks
                );
                let kind = match clean {
                    CloseReason::Stop => PipelineEventKind::Stopped,
                    _ => PipelineEventKind::Completed,
                };
                (kind, Some(metadata))
            }
        };

        let _ = self.events_tx.send(PipelineEvent {
            session_id: self.session_id,
            kind,
            output_path: self.output_path,
            metadata,
        });
    }

    fn write_sidecar(&self, metadata: &SidecarMetadata) {
        let path = self.output_path.with_extension("json");
        let result = serde_json::to_string_pretty(metadata)
            .map_err(anyhow::Error::from)
            .and_then(|json| fs::write(&path, json).map_err(anyhow::Error::from));
        match result {
            Ok(()) => debug!("[pipeline] sidecar written to {:?}", path),
            // The capture itself succeeded; a missing sidecar only
            // hides the file from the catalog.
            Err(err) => warn!("[pipeline] sidecar write failed: {}", err),
        }
    }
}

fn write_block(
    wav: &mut WavWriter<BufWriter<fs::File>>,
    samples: &[i16],
    channels: u16,
) -> Result<u64, hound::Error> {
    for sample in samples {
        wav.write_sample(*sample)?;
    }
    Ok(samples.len() as u64 / channels as u64)
}
