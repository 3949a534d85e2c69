//! Wire model for the control channel.
//!
//! Every message is one JSON object, keyed on a `type` field. On the
//! TCP control channel a message is one line; on the dashboard
//! websocket it is one text frame. The enums here are closed: anything
//! that does not parse into them is a protocol error and gets an
//! explicit `error` reply instead of a silent drop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command verbs a dashboard may issue against a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandVerb {
    StartRecording,
    StopRecording,
    GetStatus,
    UpdateConfig,
    ListDevices,
    Shutdown,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::GetStatus => "get_status",
            Self::UpdateConfig => "update_config",
            Self::ListDevices => "list_devices",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecordingStarted,
    RecordingCompleted,
    RecordingStopped,
    RecordingError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordingStarted => "recording_started",
            Self::RecordingCompleted => "recording_completed",
            Self::RecordingStopped => "recording_stopped",
            Self::RecordingError => "recording_error",
        }
    }
}

/// One entry in the capability listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: Option<u32>,
    pub name: String,
    pub channels: u16,
    pub samplerate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    pub device: String,
    pub samplerate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub devices: Vec<DeviceInfo>,
    pub supported_samplerates: Vec<u32>,
    pub supported_channels: Vec<u16>,
}

/// Client-side view of a recorder. The hub keeps a copy per
/// connection, but that copy is a cache: it is only ever replaced by
/// the next status push, never mutated hub-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub recording: bool,
    pub config: StatusConfig,
    pub capabilities: Capabilities,
}

/// Sidecar written next to every finished capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    pub client_id: String,
    pub device: String,
    pub samplerate: u32,
    pub channels: u16,
    pub started_at: String,
    pub duration: f64,
    pub total_frames: u64,
    pub dropped_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDescriptor {
    pub filename: String,
    pub created: String,
    pub size: u64,
    pub metadata: SidecarMetadata,
}

/// Recorder client -> hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        client_id: String,
    },
    Status {
        client_id: String,
        status: RecorderStatus,
    },
    Event {
        client_id: String,
        kind: EventKind,
        data: Value,
        timestamp: String,
    },
    /// Explicit reply for rejected or out-of-state commands.
    Error {
        client_id: String,
        error: String,
    },
}

/// Dashboard -> hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    Command {
        client_id: String,
        command: CommandVerb,
        #[serde(default)]
        payload: Value,
    },
    GetRecordings,
    RefreshRecorders,
}

/// Hub -> recorder client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToClient {
    Command {
        command: CommandVerb,
        #[serde(default)]
        payload: Value,
    },
    Error {
        error: String,
    },
}

/// Hub -> dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubToDashboard {
    InitialState {
        recorders: HashMap<String, RecorderStatus>,
        recordings: Vec<RecordingDescriptor>,
    },
    RecorderStatus {
        client_id: String,
        status: RecorderStatus,
    },
    RecorderConnected {
        client_id: String,
    },
    RecorderDisconnected {
        client_id: String,
    },
    RecorderRecordingStarted {
        data: Value,
    },
    RecorderRecordingCompleted {
        data: Value,
    },
    RecorderRecordingStopped {
        data: Value,
    },
    RecorderRecordingError {
        data: Value,
    },
    RecordingsUpdated {
        recordings: Vec<RecordingDescriptor>,
    },
    CommandResponse {
        client_id: String,
        response: Value,
    },
    RecorderError {
        client_id: String,
        error: String,
    },
    Error {
        error: String,
    },
}

impl HubToDashboard {
    /// Rebroadcast shape for a recorder event: the event kind becomes
    /// part of the message type, the payload keeps the client id.
    pub fn from_event(kind: EventKind, data: Value) -> Self {
        match kind {
            EventKind::RecordingStarted => Self::RecorderRecordingStarted { data },
            EventKind::RecordingCompleted => Self::RecorderRecordingCompleted { data },
            EventKind::RecordingStopped => Self::RecorderRecordingStopped { data },
            EventKind::RecordingError => Self::RecorderRecordingError { data },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"register","client_id":"mic1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Register {
                client_id: "mic1".into()
            }
        );
    }

    #[test]
    fn command_wire_shape() {
        let raw = r#"{"type":"command","client_id":"mic1","command":"start_recording","payload":{"duration":5}}"#;
        let msg: DashboardMessage = serde_json::from_str(raw).unwrap();
        match msg {
            DashboardMessage::Command {
                client_id,
                command,
                payload,
            } => {
                assert_eq!(client_id, "mic1");
                assert_eq!(command, CommandVerb::StartRecording);
                assert_eq!(payload["duration"], json!(5));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn command_payload_defaults_to_null() {
        let raw = r#"{"type":"command","client_id":"all","command":"get_status"}"#;
        let msg: DashboardMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            DashboardMessage::Command {
                client_id: "all".into(),
                command: CommandVerb::GetStatus,
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn event_rebroadcast_tags() {
        let msg =
            HubToDashboard::from_event(EventKind::RecordingCompleted, json!({"client_id": "mic1"}));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "recorder_recording_completed");
        assert_eq!(wire["data"]["client_id"], "mic1");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_str::<DashboardMessage>(r#"{"type":"reboot_universe"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn event_kind_round_trip() {
        for kind in [
            EventKind::RecordingStarted,
            EventKind::RecordingCompleted,
            EventKind::RecordingStopped,
            EventKind::RecordingError,
        ] {
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{}\"", kind.as_str()));
        }
    }
}
