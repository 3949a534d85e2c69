use std::io;

use thiserror::Error;

/// Failure to open or enumerate a capture device. Fatal to a start
/// attempt, never retried automatically.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{device}' unavailable: {reason}")]
    Unavailable { device: String, reason: String },
    #[error("failed to enumerate capture devices: {0}")]
    Enumerate(String),
}

impl DeviceError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Session-level failure. Terminates the session; the file on disk is
/// left as-is.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture session is already active")]
    AlreadyRecording,
    #[error("no active capture session")]
    NoActiveSession,
    #[error(transparent)]
    Open(#[from] DeviceError),
    #[error("wav write failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("capture i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Malformed or out-of-state message. Rejected with an explicit error
/// reply, connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected register as first message")]
    RegisterExpected,
    #[error("command '{command}' rejected: {reason}")]
    OutOfState { command: String, reason: String },
}

/// Connection-level failure. Not recoverable on the connection itself;
/// clients reconnect, the hub evicts the registry entry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("send timed out")]
    SendTimeout,
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}
