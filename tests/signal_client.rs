//! Signaling client against the in-memory server: registration gating,
//! pending buffer, reconnection and stale connections.

use ranchat::signal::{Credentials, SignalClient, SignalConfig, SignalError, SignalEvent};
use ranchat::test_utils::settle;
use ranchat::transport::mock::MockTransportFactory;
use ranchat::types::{Membership, SignalStatus};
use ranchat_core::protocol::{MatchFilters, RelayPayload};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn creds() -> Credentials {
    Credentials::new("tok", "device-1")
}

fn filters() -> MatchFilters {
    MatchFilters::new("KR", "male", "linux")
}

fn drain(rx: &mut UnboundedReceiver<SignalEvent>) -> Vec<SignalEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn spawn(server: &MockTransportFactory) -> (SignalClient, UnboundedReceiver<SignalEvent>) {
    SignalClient::spawn(Arc::new(server.clone()), SignalConfig::default())
}

#[tokio::test(start_paused = true)]
async fn nothing_but_register_goes_out_before_registered() {
    let server = MockTransportFactory::new().without_auto_register();
    let (client, mut events) = spawn(&server);

    client.connect("ws://test", creds()).unwrap();
    client.enqueue(filters()).unwrap();
    client
        .relay("r0", RelayPayload::CameraState { enabled: true })
        .unwrap();
    settle().await;

    assert_eq!(server.sent_types(), vec!["register"]);
    assert_eq!(server.sent()[0]["sessionId"], "device-1");
    assert_eq!(client.status(), SignalStatus::AwaitingRegistration);
    assert!(drain(&mut events).is_empty());

    server.push(json!({"type": "registered"}));
    settle().await;

    assert_eq!(
        server.sent_types(),
        vec!["register", "signal:cam_state", "enqueue"]
    );
    let enqueue = &server.sent()[2];
    assert_eq!(enqueue["country"], "KR");
    assert_eq!(enqueue["gender"], "male");
    assert_eq!(
        drain(&mut events),
        vec![SignalEvent::Connected, SignalEvent::Queued]
    );
    assert_eq!(client.membership(), Membership::Queued);
}

#[tokio::test(start_paused = true)]
async fn pending_buffer_drops_the_oldest() {
    let server = MockTransportFactory::new().without_auto_register();
    let (client, _events) = SignalClient::spawn(
        Arc::new(server.clone()),
        SignalConfig {
            pending_capacity: 3,
        },
    );
    client.connect("ws://test", creds()).unwrap();
    for i in 0..5 {
        client
            .relay("r1", RelayPayload::Other(json!({"type": "note", "i": i})))
            .unwrap();
    }
    settle().await;
    server.push(json!({"type": "registered"}));
    settle().await;

    let kept: Vec<_> = server.sent()[1..]
        .iter()
        .map(|frame| frame["data"]["i"].as_i64().unwrap())
        .collect();
    assert_eq!(kept, vec![2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn reconnects_with_backoff_and_restores_the_queue() {
    let server = MockTransportFactory::new();
    let (client, mut events) = spawn(&server);
    client.connect("ws://test", creds()).unwrap();
    client.enqueue(filters()).unwrap();
    settle().await;
    assert_eq!(client.status(), SignalStatus::Registered);
    drain(&mut events);

    server.fail_next_dials(1);
    server.drop_connection();
    settle().await;
    assert_eq!(drain(&mut events), vec![SignalEvent::Disconnected]);
    assert_eq!(client.status(), SignalStatus::Disconnected);

    // First retry lands between 500 and 750 ms and fails.
    tokio::time::advance(Duration::from_millis(400)).await;
    settle().await;
    assert_eq!(server.dial_count(), 1);
    tokio::time::advance(Duration::from_millis(400)).await;
    settle().await;
    assert_eq!(server.dial_count(), 2);

    // Second retry waits at least a second.
    tokio::time::advance(Duration::from_millis(900)).await;
    settle().await;
    assert_eq!(server.dial_count(), 2);
    tokio::time::advance(Duration::from_millis(400)).await;
    settle().await;
    assert_eq!(server.dial_count(), 3);

    assert_eq!(client.status(), SignalStatus::Registered);
    assert_eq!(
        drain(&mut events),
        vec![SignalEvent::Connected, SignalEvent::Queued]
    );
    let enqueues = server
        .sent_types()
        .iter()
        .filter(|t| t.as_str() == "enqueue")
        .count();
    assert_eq!(enqueues, 2);
}

#[tokio::test(start_paused = true)]
async fn close_cancels_a_scheduled_reconnect() {
    let server = MockTransportFactory::new();
    let (client, mut events) = spawn(&server);
    client.connect("ws://test", creds()).unwrap();
    settle().await;

    server.drop_connection();
    settle().await;
    client.close();
    client.close();
    settle().await;

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(server.dial_count(), 1);
    assert_eq!(client.status(), SignalStatus::Closed);
    assert_eq!(
        drain(&mut events),
        vec![SignalEvent::Connected, SignalEvent::Disconnected]
    );
}

#[tokio::test(start_paused = true)]
async fn connect_supersedes_a_scheduled_reconnect() {
    let server = MockTransportFactory::new();
    let (client, mut events) = spawn(&server);
    client.connect("ws://test", creds()).unwrap();
    settle().await;

    server.drop_connection();
    settle().await;
    assert_eq!(client.status(), SignalStatus::Disconnected);

    // Still inside the first backoff window.
    tokio::time::advance(Duration::from_millis(200)).await;
    client.connect("ws://other", creds()).unwrap();
    settle().await;
    assert_eq!(server.dial_count(), 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(server.dialed_urls(), vec!["ws://test", "ws://other"]);
    assert_eq!(server.open_connections(), 1);
    assert_eq!(client.status(), SignalStatus::Registered);
    assert_eq!(
        drain(&mut events),
        vec![
            SignalEvent::Connected,
            SignalEvent::Disconnected,
            SignalEvent::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn a_superseded_dial_is_discarded() {
    let server = MockTransportFactory::new();
    let (client, mut events) = spawn(&server);
    client.connect("ws://first", creds()).unwrap();
    client.connect("ws://second", creds()).unwrap();
    settle().await;

    assert_eq!(server.dial_count(), 2);
    assert_eq!(server.open_connections(), 1);
    assert_eq!(server.sent_types(), vec!["register"]);
    assert_eq!(drain(&mut events), vec![SignalEvent::Connected]);
}

#[tokio::test(start_paused = true)]
async fn incomplete_credentials_never_dial() {
    let server = MockTransportFactory::new();
    let (client, _events) = spawn(&server);
    assert_eq!(
        client.connect("ws://test", Credentials::new("tok", " ")),
        Err(SignalError::MissingCredentials)
    );
    settle().await;
    assert_eq!(server.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn server_frames_map_to_events() {
    let server = MockTransportFactory::new();
    let (client, mut events) = spawn(&server);
    client.connect("ws://test", creds()).unwrap();
    settle().await;
    drain(&mut events);

    server.push(json!({"type": "matched", "roomId": "r9", "initiator": false}));
    server.push(json!({"type": "signal", "roomId": "r9", "data": {"type": "cam", "videoOn": false}}));
    server.push(json!({"type": "signal", "roomId": "r9", "data": {"type": "leave"}}));
    server.push(json!({"type": "left_ok"}));
    server.push(json!({"type": "error", "message": "ROOM_FULL"}));
    server.push(json!({"type": "mystery"}));
    server.push_text("not json");
    settle().await;

    let events = drain(&mut events);
    assert_eq!(events.len(), 6);
    assert!(matches!(
        &events[0],
        SignalEvent::Matched { room_id, .. } if room_id == "r9"
    ));
    assert_eq!(
        events[1],
        SignalEvent::Relay {
            room_id: "r9".into(),
            payload: RelayPayload::CameraState { enabled: false },
        }
    );
    assert_eq!(events[2], SignalEvent::End);
    assert_eq!(events[3], SignalEvent::ServerError("ROOM_FULL".into()));
    assert!(matches!(events[4], SignalEvent::ProtocolError(_)));
    assert!(matches!(events[5], SignalEvent::ProtocolError(_)));
}

#[tokio::test(start_paused = true)]
async fn leave_room_names_the_room() {
    let server = MockTransportFactory::new();
    let (client, _events) = spawn(&server);
    client.connect("ws://test", creds()).unwrap();
    settle().await;
    server.push(json!({"type": "matched", "roomId": "r2", "initiator": true}));
    settle().await;
    assert_eq!(client.membership(), Membership::InRoom("r2".into()));

    client.leave_room(Some("r2".into())).unwrap();
    settle().await;
    let leave = server.sent().last().cloned().unwrap();
    assert_eq!(leave, json!({"type": "leave", "roomId": "r2"}));
    assert_eq!(client.membership(), Membership::Idle);
}
