//! Capture sources: device-specific producers of timestamped sample
//! blocks. A source delivers blocks on its own thread via a callback
//! that must never block; everything downstream of that callback is
//! the pipeline's problem.

pub mod pipeline;
pub mod sine;

#[cfg(feature = "audio")]
pub mod alsa;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::CaptureConfig;
use crate::error::DeviceError;
use crate::protocol::{Capabilities, DeviceInfo};

/// Samplerates accepted by `update_config`.
pub const SUPPORTED_SAMPLERATES: [u32; 7] =
    [8_000, 16_000, 22_050, 44_100, 48_000, 96_000, 192_000];

/// Channel counts accepted by `update_config`.
pub const SUPPORTED_CHANNELS: [u16; 2] = [1, 2];

/// One fixed-size block of interleaved PCM as delivered by the
/// hardware.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub seq: u64,
    pub captured_at_ns: u64,
    pub samples: Vec<i16>,
}

/// What a source hands to the pipeline: blocks while healthy, one
/// fault when the device dies mid-session.
#[derive(Debug)]
pub enum SourceEvent {
    Block(SampleBlock),
    Fault(String),
}

pub type BlockCallback = Box<dyn FnMut(SourceEvent) + Send + 'static>;

pub trait CaptureSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start the device stream. The callback runs on the source's own
    /// thread; it must not block or the hardware loses data.
    fn open(&self, config: &CaptureConfig, on_event: BlockCallback)
    -> Result<SourceHandle, DeviceError>;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;
}

/// Running stream handle. `close()` stops the producer thread and
/// joins it, after which no further callback invocations happen.
pub struct SourceHandle {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn new(running: Arc<AtomicBool>, join: JoinHandle<()>) -> Self {
        Self {
            running,
            join: Some(join),
        }
    }

    pub fn close(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("[capture] source thread panicked");
            }
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.shut_down();
    }
}

pub fn utc_ns_now() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_secs() * 1_000_000_000 + d.subsec_nanos() as u64
}

/// Capability block for status pushes, built from whatever the source
/// can enumerate. Enumeration failure degrades to an empty device list
/// rather than failing the status push.
pub fn capabilities(source: &dyn CaptureSource) -> Capabilities {
    let devices = match source.list_devices() {
        Ok(devices) => devices,
        Err(err) => {
            log::warn!("[capture] device enumeration failed: {}", err);
            Vec::new()
        }
    };
    Capabilities {
        devices,
        supported_samplerates: SUPPORTED_SAMPLERATES.to_vec(),
        supported_channels: SUPPORTED_CHANNELS.to_vec(),
    }
}

/// Pick the source for this build: ALSA when compiled with real audio
/// support, the synthetic tone otherwise.
#[cfg(all(feature = "audio", not(feature = "mock-audio")))]
pub fn default_source(config: &CaptureConfig) -> Box<dyn CaptureSource> {
    Box::new(alsa::AlsaSource::new(&config.device))
}

#[cfg(not(all(feature = "audio", not(feature = "mock-audio"))))]
pub fn default_source(_config: &CaptureConfig) -> Box<dyn CaptureSource> {
    Box::new(sine::SineSource::new(440.0))
}
