//! Hub actor behavior, driven through its input channel: registry
//! bookkeeping, command routing, fan-out isolation and catalog
//! rebuilds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use fieldrec::config::HubConfig;
use fieldrec::hub::{BROADCAST_ID, Hub, HubHandle, HubInput, serve_listener};
use fieldrec::protocol::{
    Capabilities, ClientMessage, CommandVerb, DashboardMessage, EventKind, HubToClient,
    HubToDashboard, RecorderStatus, SidecarMetadata, StatusConfig,
};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn spawn_hub(dir: &Path) -> HubHandle {
    let (hub, handle) = Hub::new(dir.to_path_buf());
    tokio::spawn(hub.run());
    handle
}

fn connect_recorder(
    handle: &HubHandle,
    client_id: &str,
    conn_seq: u64,
    capacity: usize,
) -> mpsc::Receiver<HubToClient> {
    let (tx, rx) = mpsc::channel(capacity);
    handle.send(HubInput::RecorderConnected {
        client_id: client_id.to_string(),
        conn_seq,
        outbound: tx,
    });
    rx
}

fn connect_dashboard(handle: &HubHandle, dash_id: u64) -> mpsc::Receiver<HubToDashboard> {
    let (tx, rx) = mpsc::channel(256);
    handle.send(HubInput::DashboardConnected {
        dash_id,
        outbound: tx,
    });
    rx
}

fn idle_status() -> RecorderStatus {
    RecorderStatus {
        recording: false,
        config: StatusConfig {
            device: "default".to_string(),
            samplerate: 44_100,
            channels: 1,
        },
        capabilities: Capabilities {
            devices: Vec::new(),
            supported_samplerates: vec![44_100],
            supported_channels: vec![1, 2],
        },
    }
}

/// Skip interleaved broadcasts until one matches.
async fn next_matching<F>(
    rx: &mut mpsc::Receiver<HubToDashboard>,
    mut pred: F,
) -> HubToDashboard
where
    F: FnMut(&HubToDashboard) -> bool,
{
    loop {
        let msg = timeout(WAIT, rx.recv())
            .await
            .expect("dashboard message within deadline")
            .expect("dashboard channel open");
        if pred(&msg) {
            return msg;
        }
    }
}

#[tokio::test]
async fn dashboard_receives_initial_state_on_connect() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);

    let msg = timeout(WAIT, dash.recv()).await.unwrap().unwrap();
    match msg {
        HubToDashboard::InitialState {
            recorders,
            recordings,
        } => {
            assert!(recorders.is_empty());
            assert!(recordings.is_empty());
        }
        other => panic!("expected initial_state, got {other:?}"),
    }
}

#[tokio::test]
async fn command_routes_to_registered_recorder() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);
    let mut mic = connect_recorder(&handle, "mic1", 1, 8);

    handle.send(HubInput::DashboardMessage {
        dash_id: 1,
        message: DashboardMessage::Command {
            client_id: "mic1".to_string(),
            command: CommandVerb::StartRecording,
            payload: json!({"duration": 2.0}),
        },
    });

    let cmd = timeout(WAIT, mic.recv()).await.unwrap().unwrap();
    match cmd {
        HubToClient::Command { command, payload } => {
            assert_eq!(command, CommandVerb::StartRecording);
            assert_eq!(payload["duration"], json!(2.0));
        }
        other => panic!("expected command, got {other:?}"),
    }

    let ack = next_matching(&mut dash, |m| {
        matches!(m, HubToDashboard::CommandResponse { .. })
    })
    .await;
    match ack {
        HubToDashboard::CommandResponse {
            client_id,
            response,
        } => {
            assert_eq!(client_id, "mic1");
            assert_eq!(response["queued"], json!(true));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn command_to_unknown_recorder_yields_error() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);

    handle.send(HubInput::DashboardMessage {
        dash_id: 1,
        message: DashboardMessage::Command {
            client_id: "ghost".to_string(),
            command: CommandVerb::GetStatus,
            payload: Value::Null,
        },
    });

    let msg = next_matching(&mut dash, |m| matches!(m, HubToDashboard::Error { .. })).await;
    match msg {
        HubToDashboard::Error { error } => assert!(error.contains("ghost")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn fan_out_isolates_unreachable_recorders() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);

    // "stalled" has a depth-1 queue we deliberately fill up front;
    // "gone" dropped its receiver; "healthy" can accept commands.
    let mut stalled = connect_recorder(&handle, "stalled", 1, 1);
    let gone = connect_recorder(&handle, "gone", 2, 8);
    drop(gone);
    let mut healthy = connect_recorder(&handle, "healthy", 3, 8);

    handle.send(HubInput::DashboardMessage {
        dash_id: 1,
        message: DashboardMessage::Command {
            client_id: "stalled".to_string(),
            command: CommandVerb::GetStatus,
            payload: Value::Null,
        },
    });
    // Queue now full; the fan-out must not block on it.
    handle.send(HubInput::DashboardMessage {
        dash_id: 1,
        message: DashboardMessage::Command {
            client_id: BROADCAST_ID.to_string(),
            command: CommandVerb::StopRecording,
            payload: Value::Null,
        },
    });

    let summary = next_matching(&mut dash, |m| {
        matches!(
            m,
            HubToDashboard::CommandResponse { client_id, .. } if client_id == BROADCAST_ID
        )
    })
    .await;
    match summary {
        HubToDashboard::CommandResponse { response, .. } => {
            assert_eq!(response["delivered"], json!(1));
            let failed = response["failed"].as_array().unwrap();
            assert_eq!(failed.len(), 2);
            assert!(failed.contains(&json!("stalled")));
            assert!(failed.contains(&json!("gone")));
        }
        _ => unreachable!(),
    }

    let delivered = timeout(WAIT, healthy.recv()).await.unwrap().unwrap();
    assert!(matches!(
        delivered,
        HubToClient::Command {
            command: CommandVerb::StopRecording,
            ..
        }
    ));
    // The stalled queue still holds only the first command.
    let first = timeout(WAIT, stalled.recv()).await.unwrap().unwrap();
    assert!(matches!(
        first,
        HubToClient::Command {
            command: CommandVerb::GetStatus,
            ..
        }
    ));
}

#[tokio::test]
async fn reregistration_replaces_connection() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);

    let _old = connect_recorder(&handle, "mic1", 1, 8);
    let mut new = connect_recorder(&handle, "mic1", 2, 8);

    // The replaced connection's late disconnect must not evict the
    // live registration.
    handle.send(HubInput::RecorderDisconnected {
        client_id: "mic1".to_string(),
        conn_seq: 1,
    });

    handle.send(HubInput::DashboardMessage {
        dash_id: 1,
        message: DashboardMessage::Command {
            client_id: "mic1".to_string(),
            command: CommandVerb::GetStatus,
            payload: Value::Null,
        },
    });
    let cmd = timeout(WAIT, new.recv()).await.unwrap().unwrap();
    assert!(matches!(cmd, HubToClient::Command { .. }));

    // The current connection's disconnect does evict.
    handle.send(HubInput::RecorderDisconnected {
        client_id: "mic1".to_string(),
        conn_seq: 2,
    });
    let msg = next_matching(&mut dash, |m| {
        matches!(m, HubToDashboard::RecorderDisconnected { .. })
    })
    .await;
    match msg {
        HubToDashboard::RecorderDisconnected { client_id } => assert_eq!(client_id, "mic1"),
        _ => unreachable!(),
    }

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.recorders.is_empty());
}

#[tokio::test]
async fn status_pushes_aggregate_into_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);
    let _mic = connect_recorder(&handle, "mic1", 1, 8);

    let mut status = idle_status();
    status.recording = true;
    handle.send(HubInput::RecorderMessage {
        client_id: "mic1".to_string(),
        conn_seq: 1,
        message: ClientMessage::Status {
            client_id: "mic1".to_string(),
            status: status.clone(),
        },
    });

    let msg = next_matching(&mut dash, |m| {
        matches!(m, HubToDashboard::RecorderStatus { .. })
    })
    .await;
    match msg {
        HubToDashboard::RecorderStatus { client_id, status } => {
            assert_eq!(client_id, "mic1");
            assert!(status.recording);
        }
        _ => unreachable!(),
    }

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.recorders.len(), 1);
    assert_eq!(snapshot.recorders[0].client_id, "mic1");
    assert!(snapshot.recorders[0].recording);
}

#[tokio::test]
async fn stale_connection_messages_are_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let _mic = connect_recorder(&handle, "mic1", 2, 8);

    // Status from the replaced connection seq must not land.
    handle.send(HubInput::RecorderMessage {
        client_id: "mic1".to_string(),
        conn_seq: 1,
        message: ClientMessage::Status {
            client_id: "mic1".to_string(),
            status: idle_status(),
        },
    });

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.recorders.len(), 1);
    assert!(snapshot.recorders[0].status.is_none());
}

#[tokio::test]
async fn completed_event_rebroadcasts_and_rebuilds_catalog() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());
    let mut dash = connect_dashboard(&handle, 1);
    let _mic = connect_recorder(&handle, "mic1", 1, 8);

    // Drop a finished recording into the directory, then announce it.
    let metadata = SidecarMetadata {
        client_id: "mic1".to_string(),
        device: "default".to_string(),
        samplerate: 44_100,
        channels: 1,
        started_at: "2026-01-01T00:00:00.000Z".to_string(),
        duration: 1.0,
        total_frames: 44_100,
        dropped_blocks: 0,
    };
    fs::write(
        tmp.path().join("take1.json"),
        serde_json::to_string(&metadata).unwrap(),
    )
    .unwrap();
    fs::write(tmp.path().join("take1.wav"), [0u8; 44]).unwrap();

    handle.send(HubInput::RecorderMessage {
        client_id: "mic1".to_string(),
        conn_seq: 1,
        message: ClientMessage::Event {
            client_id: "mic1".to_string(),
            kind: EventKind::RecordingCompleted,
            data: json!({"filename": "take1.wav", "session_id": "mic1-1"}),
            timestamp: "2026-01-01T00:00:01.000Z".to_string(),
        },
    });

    let event = next_matching(&mut dash, |m| {
        matches!(m, HubToDashboard::RecorderRecordingCompleted { .. })
    })
    .await;
    match event {
        HubToDashboard::RecorderRecordingCompleted { data } => {
            // The hub stamps the sender onto the payload.
            assert_eq!(data["client_id"], json!("mic1"));
            assert_eq!(data["filename"], json!("take1.wav"));
        }
        _ => unreachable!(),
    }

    let update = next_matching(&mut dash, |m| {
        matches!(
            m,
            HubToDashboard::RecordingsUpdated { recordings } if !recordings.is_empty()
        )
    })
    .await;
    match update {
        HubToDashboard::RecordingsUpdated { recordings } => {
            assert_eq!(recordings.len(), 1);
            assert_eq!(recordings[0].filename, "take1.wav");
            assert_eq!(recordings[0].metadata.client_id, "mic1");
        }
        _ => unreachable!(),
    }

    let listed = handle.recordings().await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn stalled_peer_is_evicted_when_its_write_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_hub(tmp.path());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let cfg = HubConfig {
        send_timeout_ms: 200,
        ..HubConfig::default()
    };
    tokio::spawn(serve_listener(listener, cfg, handle.clone(), shutdown_rx));

    // A peer that registers and then stops reading. The tiny receive
    // buffer makes the kernel backpressure the hub's writes quickly.
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let mut wedged = socket.connect(addr).await.unwrap();
    let register = serde_json::to_string(&ClientMessage::Register {
        client_id: "wedged".to_string(),
    })
    .unwrap();
    wedged.write_all(register.as_bytes()).await.unwrap();
    wedged.write_all(b"\n").await.unwrap();

    let mut registered = false;
    for _ in 0..100 {
        if !handle.snapshot().await.unwrap().recorders.is_empty() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registered, "handshake should land in the registry");

    // Flood the connection until the socket buffers fill and a write
    // stalls past the send timeout.
    let pump = handle.clone();
    let pump_task = tokio::spawn(async move {
        let payload = json!({ "padding": "x".repeat(32 * 1024) });
        loop {
            pump.send(HubInput::DashboardMessage {
                dash_id: 1,
                message: DashboardMessage::Command {
                    client_id: "wedged".to_string(),
                    command: CommandVerb::GetStatus,
                    payload: payload.clone(),
                },
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    // The connection task must report the disconnect so the registry
    // drops the record, not just abandon the write.
    let mut evicted = false;
    for _ in 0..300 {
        if handle.snapshot().await.unwrap().recorders.is_empty() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pump_task.abort();
    assert!(evicted, "stalled peer should be evicted after the send timeout");

    drop(wedged);
}
