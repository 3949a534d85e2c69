//! Synthetic tone source. Same contract as the real hardware: a
//! producer thread pushing fixed-size blocks in real time, so the
//! pipeline and tests exercise the exact handoff path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::capture::{BlockCallback, CaptureSource, SampleBlock, SourceEvent, SourceHandle};
use crate::config::CaptureConfig;
use crate::error::DeviceError;
use crate::protocol::DeviceInfo;

pub struct SineSource {
    freq: f32,
}

impl SineSource {
    pub fn new(freq: f32) -> Self {
        Self { freq }
    }
}

impl CaptureSource for SineSource {
    fn name(&self) -> &str {
        "sine"
    }

    fn open(
        &self,
        config: &CaptureConfig,
        mut on_event: BlockCallback,
    ) -> Result<SourceHandle, DeviceError> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let freq = self.freq;
        let rate = config.samplerate;
        let channels = config.channels as usize;
        let block_frames = config.block_frames();
        let block_ms = config.block_ms;

        let join = thread::spawn(move || {
            let mut phase: f32 = 0.0;
            let step = 2.0 * std::f32::consts::PI * freq / rate as f32;
            let mut seq: u64 = 0;

            while r.load(Ordering::Relaxed) {
                let mut samples = Vec::with_capacity(block_frames * channels);
                for _ in 0..block_frames {
                    let v = (phase.sin() * 0.2 * i16::MAX as f32) as i16;
                    for _ in 0..channels {
                        samples.push(v);
                    }
                    phase += step;
                }

                seq += 1;
                on_event(SourceEvent::Block(SampleBlock {
                    seq,
                    captured_at_ns: crate::capture::utc_ns_now(),
                    samples,
                }));

                thread::sleep(Duration::from_millis(block_ms));
            }
        });

        Ok(SourceHandle::new(running, join))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(vec![DeviceInfo {
            id: Some(0),
            name: "sine".to_string(),
            channels: 2,
            samplerate: 44_100,
        }])
    }
}
