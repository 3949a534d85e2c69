use std::fs;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// TCP listener for recorder clients.
    #[serde(default = "default_client_bind")]
    pub client_bind: String,
    /// HTTP/WebSocket listener for dashboards.
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,
    /// Budget for one outbound push to a peer. A timed-out push is a
    /// disconnect for that peer, not a retry.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_bind: default_client_bind(),
            api_bind: default_api_bind(),
            recordings_dir: default_recordings_dir(),
            send_timeout_ms: default_send_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_recordings_dir")]
    pub output_dir: String,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_addr: default_hub_addr(),
            client_id: default_client_id(),
            output_dir: default_recordings_dir(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_samplerate")]
    pub samplerate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Target block size the source delivers, in milliseconds.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Depth of the producer/consumer handoff queue, in blocks. When
    /// full, new blocks are dropped and counted rather than blocking
    /// the hardware callback.
    #[serde(default = "default_queue_blocks")]
    pub queue_blocks: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            samplerate: default_samplerate(),
            channels: default_channels(),
            block_ms: default_block_ms(),
            queue_blocks: default_queue_blocks(),
        }
    }
}

impl CaptureConfig {
    /// Frames per block.
    pub fn block_frames(&self) -> usize {
        (self.samplerate as u64 * self.block_ms / 1000) as usize
    }

    /// Interleaved samples per block.
    pub fn block_samples(&self) -> usize {
        self.block_frames() * self.channels as usize
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config '{}'", path))?;
        let config: Self = toml::from_str(&content)?;
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    /// Load `path`, falling back to built-in defaults when the file
    /// does not exist. A file that exists but fails to parse or
    /// validate is still an error.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if fs::metadata(path).is_err() {
            let config = Self::default();
            config.validate().context("config validation failed")?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client.client_id.trim().is_empty() {
            bail!("client.client_id must not be empty");
        }
        if self.client.client_id == "all" {
            bail!("client.client_id 'all' is reserved for fan-out");
        }
        if self.capture.samplerate == 0 {
            bail!("capture.samplerate must be > 0");
        }
        if !matches!(self.capture.channels, 1 | 2) {
            bail!("capture.channels must be 1 (mono) or 2 (stereo)");
        }
        if self.capture.block_ms == 0 {
            bail!("capture.block_ms must be > 0");
        }
        if self.capture.queue_blocks == 0 {
            bail!("capture.queue_blocks must be > 0");
        }
        if self.hub.send_timeout_ms == 0 || self.client.send_timeout_ms == 0 {
            bail!("send_timeout_ms must be > 0");
        }
        Ok(())
    }
}

fn default_client_bind() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_hub_addr() -> String {
    "127.0.0.1:9100".to_string()
}

fn default_client_id() -> String {
    "recorder".to_string()
}

fn default_recordings_dir() -> String {
    "recordings".to_string()
}

fn default_device() -> String {
    "default".to_string()
}

fn default_samplerate() -> u32 {
    44_100
}

fn default_channels() -> u16 {
    1
}

fn default_block_ms() -> u64 {
    100
}

fn default_queue_blocks() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    1_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.capture.samplerate, 44_100);
        assert_eq!(cfg.capture.block_frames(), 4_410);
        assert_eq!(cfg.hub.client_bind, "0.0.0.0:9100");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [client]
            client_id = "mic1"
            hub_addr = "10.0.0.5:9100"

            [capture]
            samplerate = 48000
            channels = 2
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.client.client_id, "mic1");
        assert_eq!(cfg.capture.block_samples(), 9_600);
        assert_eq!(cfg.client.output_dir, "recordings");
    }

    #[test]
    fn reserved_client_id_rejected() {
        let cfg: Config = toml::from_str("[client]\nclient_id = \"all\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_samplerate_rejected() {
        let cfg: Config = toml::from_str("[capture]\nsamplerate = 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
