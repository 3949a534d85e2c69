//! ALSA-backed capture source. The PCM read loop runs on its own
//! thread and hands fixed-size blocks to the pipeline callback; a
//! fatal device error is reported once as a fault and ends the thread.

use std::ffi::CStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use log::{debug, info, warn};

use crate::capture::{BlockCallback, CaptureSource, SampleBlock, SourceEvent, SourceHandle};
use crate::config::CaptureConfig;
use crate::error::DeviceError;
use crate::protocol::DeviceInfo;

pub struct AlsaSource {
    device: String,
}

impl AlsaSource {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
        }
    }
}

impl CaptureSource for AlsaSource {
    fn name(&self) -> &str {
        "alsa"
    }

    fn open(
        &self,
        config: &CaptureConfig,
        mut on_event: BlockCallback,
    ) -> Result<SourceHandle, DeviceError> {
        let device = self.device.clone();
        let samplerate = config.samplerate;
        let channels = config.channels as u32;
        let block_samples = config.block_samples();

        // Open on the caller's thread so a missing device fails the
        // start attempt instead of surfacing later as a fault.
        let pcm = open_pcm(&device, samplerate, channels)
            .map_err(|e| DeviceError::unavailable(&device, e))?;

        info!(
            "[alsa] capture started: {} {}Hz {}ch",
            device, samplerate, channels
        );

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let join = thread::spawn(move || {
            let io = match pcm.io_i16() {
                Ok(io) => io,
                Err(e) => {
                    on_event(SourceEvent::Fault(format!("i16 io unavailable: {}", e)));
                    return;
                }
            };

            let mut buffer = vec![0i16; block_samples];
            let mut fifo: Vec<i16> = Vec::with_capacity(block_samples * 2);
            let mut seq: u64 = 0;

            while r.load(Ordering::Relaxed) {
                match io.readi(&mut buffer) {
                    Ok(frames) if frames > 0 => {
                        let samples_read = frames * channels as usize;
                        fifo.extend_from_slice(&buffer[..samples_read]);

                        while fifo.len() >= block_samples {
                            let samples: Vec<i16> = fifo.drain(..block_samples).collect();
                            seq += 1;
                            on_event(SourceEvent::Block(SampleBlock {
                                seq,
                                captured_at_ns: crate::capture::utc_ns_now(),
                                samples,
                            }));
                        }
                    }
                    Ok(_) => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        // Overruns are recoverable, anything else kills
                        // the session.
                        if pcm.try_recover(e, true).is_err() {
                            warn!("[alsa] unrecoverable read error: {}", e);
                            on_event(SourceEvent::Fault(format!("alsa read failed: {}", e)));
                            return;
                        }
                        debug!("[alsa] recovered from read error: {}", e);
                    }
                }
            }
        });

        Ok(SourceHandle::new(running, join))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let hints = alsa::device_name::HintIter::new(
            None,
            CStr::from_bytes_with_nul(b"pcm\0").expect("static nul-terminated string"),
        )
        .map_err(|e| DeviceError::Enumerate(e.to_string()))?;

        let mut devices = Vec::new();
        for (idx, hint) in hints.enumerate() {
            let Some(name) = hint.name else { continue };
            if !matches!(hint.direction, Some(Direction::Capture) | None) {
                continue;
            }
            devices.push(DeviceInfo {
                id: Some(idx as u32),
                name,
                channels: 2,
                samplerate: 48_000,
            });
        }
        Ok(devices)
    }
}

fn open_pcm(device: &str, samplerate: u32, channels: u32) -> anyhow::Result<PCM> {
    let pcm = PCM::new(device, Direction::Capture, false)?;
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::s16())?;
        hwp.set_channels(channels)?;
        hwp.set_rate(samplerate, ValueOr::Nearest)?;
        let period = hwp.set_period_size_near(480, ValueOr::Nearest)?;
        hwp.set_buffer_size_near(period * 4)?;
        pcm.hw_params(&hwp)?;
    }
    pcm.prepare()?;
    Ok(pcm)
}
