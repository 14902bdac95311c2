//! Integration tests for `Connection` against a loopback fake Core.
//!
//! These tests exercise the real socket path: framing on the wire, the
//! receive loop, correlation by id, notification routing, the keep-alive
//! task, and the state machine on peer close and on disconnect.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{notification, response, FakeCore, StalledCore, WAIT};
use qrc_client::infrastructure::network::KeepAlive;
use qrc_client::{Connection, ConnectionEvent, ConnectionState};
use qrc_core::{encode_frame, ErrorKind, QrcError};
use serde_json::json;
use tokio::sync::mpsc;

/// Waits for the first event matching `pick`, skipping others.
async fn wait_for_event<T>(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    mut pick: impl FnMut(ConnectionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("event within timeout")
}

// ── Request / response ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_get_resolves_first_request_and_clears_pending() {
    // Arrange
    let mut core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.expect("connect");

    // Act
    let reply = conn.call("StatusGet", json!({}), WAIT).await.expect("call");

    // Assert
    let request = core.next_request().await;
    assert_eq!(
        request,
        json!({"jsonrpc": "2.0", "method": "StatusGet", "params": {}, "id": 1})
    );
    assert_eq!(reply.id, 1);
    assert_eq!(reply.into_result().unwrap(), json!({"Status": "OK"}));
    assert!(!conn.is_pending(1));
    assert_eq!(conn.pending_requests(), 0);

    conn.disconnect().await;
}

#[tokio::test]
async fn test_request_ids_increase_per_call() {
    let mut core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    for _ in 0..3 {
        conn.call("NoOp", json!({}), WAIT).await.unwrap();
    }

    let ids: Vec<u64> = core
        .drain_requests()
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_malformed_frame_then_valid_response_in_same_chunk() {
    // Arrange – the Core stays silent so the test controls every reply byte
    let mut core = FakeCore::silent().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    let (reply, ()) = tokio::join!(conn.call("StatusGet", json!({}), WAIT), async {
        let request = core.next_request().await;
        let id = request["id"].as_u64().unwrap();
        let mut chunk = b"{this is not json\0".to_vec();
        chunk.extend(encode_frame(&response(99, json!("stray"))).unwrap());
        chunk.extend(encode_frame(&response(id, json!({"Status": "OK"}))).unwrap());
        core.push_raw(chunk);
    });

    // Assert
    assert_eq!(reply.unwrap().into_result().unwrap(), json!({"Status": "OK"}));
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_response_split_across_reads_is_reassembled() {
    let mut core = FakeCore::silent().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    let (reply, ()) = tokio::join!(conn.call("StatusGet", json!({}), WAIT), async {
        let request = core.next_request().await;
        let bytes = encode_frame(&response(request["id"].as_u64().unwrap(), json!(42))).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        core.push_raw(head.to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.push_raw(tail.to_vec());
    });

    assert_eq!(reply.unwrap().result(), Some(&json!(42)));
}

#[tokio::test]
async fn test_call_times_out_when_core_is_silent() {
    // Arrange
    let core = FakeCore::silent().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    let err = conn
        .call("StatusGet", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();

    // Assert
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_abandoned_send_does_not_corrupt_next_request() {
    // Arrange
    let mut core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();
    let blob = "x".repeat(4 * 1024 * 1024);

    // Act – stop waiting on a large send while it is still being written
    let _ = tokio::time::timeout(
        Duration::from_millis(1),
        conn.send("NoOp", json!({"Blob": blob})),
    )
    .await;
    let reply = conn.call("StatusGet", json!({}), WAIT).await;

    // Assert
    assert_eq!(reply.unwrap().into_result().unwrap(), json!({"Status": "OK"}));
    let requests = core.drain_requests();
    assert_eq!(requests.last().unwrap()["method"], "StatusGet");
    assert_eq!(conn.state(), ConnectionState::Connected);
}

// ── Notifications ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_change_group_notifications_routed_by_id() {
    // Arrange
    let core = FakeCore::start().await;
    let (conn, mut events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();
    let mut group_a = conn.subscribe_change_group("a");
    let mut group_b = conn.subscribe_change_group("b");

    // Act
    core.push(notification(
        "ChangeGroup.AutoPoll",
        json!({"Id": "b", "Changes": [{"Name": "gain", "Value": -3}]}),
    ));
    core.push(notification("EngineStatus", json!({"State": "Active"})));

    // Assert
    let routed = tokio::time::timeout(WAIT, group_b.recv())
        .await
        .expect("routed in time")
        .expect("subscription open");
    assert_eq!(routed.change_group_id(), Some("b"));
    assert!(group_a.try_recv().is_err());

    let unclaimed = wait_for_event(&mut events, |event| match event {
        ConnectionEvent::Notification(n) => Some(n),
        _ => None,
    })
    .await;
    assert_eq!(unclaimed.method, "EngineStatus");
}

#[tokio::test]
async fn test_method_subscription_receives_engine_status() {
    let core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();
    let mut status = conn.subscribe("EngineStatus");

    core.push(notification("EngineStatus", json!({"State": "Standby"})));

    let note = tokio::time::timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert_eq!(note.params["State"], "Standby");
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_close_moves_to_failed_and_emits_event() {
    // Arrange
    let core = FakeCore::start().await;
    let (conn, mut events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    core.close();

    // Assert
    let reason = wait_for_event(&mut events, |event| match event {
        ConnectionEvent::Failed(reason) => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.contains("closed"), "unexpected reason: {reason}");
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(matches!(
        conn.send("StatusGet", json!({})).await,
        Err(QrcError::NotConnected)
    ));
}

#[tokio::test]
async fn test_outstanding_call_fails_when_core_closes() {
    // Arrange
    let mut core = FakeCore::silent().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    let (result, ()) = tokio::join!(conn.call("StatusGet", json!({}), WAIT), async {
        core.next_request().await;
        core.close();
    });

    // Assert
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(conn.pending_requests(), 0);
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() {
    // Arrange
    let core = FakeCore::start().await;
    let (conn, mut events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    conn.disconnect().await;
    conn.disconnect().await;

    // Assert
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(
        conn.send("NoOp", json!({})).await,
        Err(QrcError::NotConnected)
    ));
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ConnectionEvent::Failed(_)),
            "intentional disconnect must not report a failure"
        );
    }
}

#[tokio::test]
async fn test_send_after_peer_reset_fails_connection() {
    // Arrange
    let core = FakeCore::start().await;
    let (conn, mut events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    // Act
    core.reset();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = conn.send("StatusGet", json!({})).await;

    // Assert
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Protocol);
    assert_eq!(conn.state(), ConnectionState::Failed);
    let reason = wait_for_event(&mut events, |event| match event {
        ConnectionEvent::Failed(reason) => Some(reason),
        _ => None,
    })
    .await;
    assert!(!reason.is_empty());
}

#[tokio::test]
async fn test_disconnect_returns_while_write_is_stalled() {
    // Arrange – the Core never reads, so a large request fills the socket buffers
    let core = StalledCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();
    let conn = Arc::new(conn);
    let sender = Arc::clone(&conn);
    let blob = "x".repeat(32 * 1024 * 1024);
    let stalled = tokio::spawn(async move { sender.send("StatusGet", json!({"Blob": blob})).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Act
    let disconnected = tokio::time::timeout(WAIT, conn.disconnect()).await;

    // Assert
    assert!(disconnected.is_ok(), "disconnect must not wait on a stalled write");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    let send = tokio::time::timeout(WAIT, stalled)
        .await
        .expect("stalled send settles")
        .expect("send task");
    assert!(send.is_err());
}

#[tokio::test]
async fn test_connect_while_connected_is_protocol_error() {
    let core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    conn.connect().await.unwrap();

    let err = conn.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let core = FakeCore::start().await;
    let (conn, _events) = Connection::new(core.connection_config());
    let state = conn.subscribe_state();

    conn.connect().await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    conn.disconnect().await;
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

// ── Keep-alive ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_connection_sends_exactly_one_noop() {
    // Arrange – 200ms of silence triggers a NoOp, checked every 20ms
    let mut core = FakeCore::start().await;
    let mut config = core.connection_config();
    config.keepalive = KeepAlive {
        check_interval: Duration::from_millis(20),
        idle_threshold: Duration::from_millis(200),
    };
    let (conn, _events) = Connection::new(config);
    conn.connect().await.unwrap();

    // Act
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Assert
    let requests = core.drain_requests();
    let methods: Vec<&str> = requests
        .iter()
        .map(|r| r["method"].as_str().unwrap())
        .collect();
    assert_eq!(methods, vec!["NoOp"]);
    assert_eq!(requests[0]["params"], json!({}));
    assert_eq!(conn.pending_requests(), 0, "the NoOp reply must be consumed");
}

#[tokio::test]
async fn test_recent_traffic_suppresses_noop() {
    let mut core = FakeCore::start().await;
    let mut config = core.connection_config();
    config.keepalive = KeepAlive {
        check_interval: Duration::from_millis(20),
        idle_threshold: Duration::from_millis(200),
    };
    let (conn, _events) = Connection::new(config);
    conn.connect().await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.call("StatusGet", json!({}), WAIT).await.unwrap();
    }

    let noops = core
        .drain_requests()
        .iter()
        .filter(|r| r["method"] == "NoOp")
        .count();
    assert_eq!(noops, 0);
}
