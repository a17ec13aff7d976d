mod support;

use std::time::Duration;

use realtime_conn::testing::MockTransport;
use realtime_conn::{
    ConnectionManager, ConnectionState, ErrorCategory, MessageType, OutboundMessage,
    RealtimeError, SendOutcome, TransportKind,
};
use support::{WAIT, fast_config, harness, wait_for_state};

fn status(id: &str) -> OutboundMessage {
    OutboundMessage::new(MessageType::StatusUpdate, sonic_rs::json!({ "step": id })).with_id(id)
}

#[tokio::test]
async fn offline_sends_keep_the_newest_and_flush_in_order() {
    let mut config = fast_config();
    config.max_queue_size = 2;
    let mut h = harness(config);

    for id in ["a", "b", "c"] {
        let outcome = h.manager.send_message(status(id)).await.expect("send");
        assert_eq!(outcome, SendOutcome::Queued(id.to_string()));
    }
    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 2);

    h.manager.connect().await.expect("connect");
    let mut server = h.ws_servers.next_connection(WAIT).await.expect("server");
    let first = server.recv_message(WAIT).await.expect("first");
    let second = server.recv_message(WAIT).await.expect("second");
    assert_eq!((first.id(), second.id()), ("b", "c"));
    assert_eq!(first.kind(), MessageType::StatusUpdate);
    assert!(server.recv_message(Duration::from_millis(50)).await.is_none());

    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 0);
}

#[tokio::test]
async fn connected_sends_go_straight_to_the_transport() {
    let mut h = harness(fast_config());
    h.manager.connect().await.expect("connect");
    let mut server = h.ws_servers.next_connection(WAIT).await.expect("server");

    let outcome = h
        .manager
        .send_message(
            OutboundMessage::new(MessageType::Event, sonic_rs::json!({ "k": 1 }))
                .with_workflow_id("wf-1"),
        )
        .await
        .expect("send");
    assert!(!outcome.is_queued());

    let received = server.recv_message(WAIT).await.expect("message");
    assert_eq!(received.id(), outcome.id());
    assert_eq!(received.workflow_id(), Some("wf-1"));
    assert!(!received.id().is_empty());
}

#[tokio::test]
async fn disabled_queue_rejects_offline_sends() {
    let mut config = fast_config();
    config.enable_offline_queue = false;
    let h = harness(config);

    let err = h.manager.send_message(status("x")).await.expect_err("offline");
    assert_eq!(err, RealtimeError::NotConnected);
}

#[tokio::test]
async fn failed_write_is_queued_and_delivered_after_reconnect() {
    let mut h = harness(fast_config());
    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");

    server.fail_writes(true);
    let outcome = h.manager.send_message(status("retry-me")).await.expect("send");
    assert_eq!(outcome, SendOutcome::Queued("retry-me".to_string()));

    let mut replacement = h.ws_servers.next_connection(WAIT).await.expect("reconnected");
    let delivered = replacement.recv_message(WAIT).await.expect("flushed");
    assert_eq!(delivered.id(), "retry-me");
    wait_for_state(&h.manager, ConnectionState::Connected, WAIT).await;
}

#[tokio::test]
async fn receive_only_transport_queues_outbound_messages() {
    let (sse, _servers) = MockTransport::receive_only(TransportKind::EventSource);
    let mut config = realtime_conn::ConnectionConfig::event_source("https://mock.test/events");
    config.enable_heartbeat = true;
    config.heartbeat_interval_ms = 20;
    let manager = ConnectionManager::builder(config)
        .transport(sse.shared())
        .build()
        .expect("spawn");

    manager.connect().await.expect("connect");
    let outcome = manager.send_message(status("later")).await.expect("send");
    assert!(outcome.is_queued());

    let snapshot = manager.debug_snapshot().await.expect("snapshot");
    assert!(!snapshot.has_writer);
    assert!(!snapshot.heartbeat_running);
    let health = manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 1);
    assert_eq!(health.transport, Some(TransportKind::EventSource));
}

#[tokio::test]
async fn receive_only_without_queue_is_unsupported() {
    let (sse, _servers) = MockTransport::receive_only(TransportKind::EventSource);
    let mut config = realtime_conn::ConnectionConfig::event_source("https://mock.test/events");
    config.enable_offline_queue = false;
    let manager = ConnectionManager::builder(config)
        .transport(sse.shared())
        .build()
        .expect("spawn");

    manager.connect().await.expect("connect");
    let err = manager.send_message(status("x")).await.expect_err("receive-only");
    assert!(matches!(err, RealtimeError::Unsupported(_)));
}

#[tokio::test]
async fn stale_entries_expire_and_are_recorded() {
    let mut config = fast_config();
    config.queue_retention_ms = 30;
    let h = harness(config);

    h.manager.send_message(status("old")).await.expect("send");
    tokio::time::sleep(Duration::from_millis(60)).await;

    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 0);
    assert_eq!(health.total_errors, 1);
    assert!(health.recent_errors[0].message.contains("old"));
}

#[tokio::test]
async fn manual_flush_is_a_no_op_while_offline() {
    let h = harness(fast_config());
    h.manager.send_message(status("held")).await.expect("send");

    let report = h.manager.flush_queue().await.expect("flush");
    assert!(report.sent.is_empty());
    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 1);
}

#[tokio::test]
async fn flush_write_failure_enters_recovery() {
    let mut config = fast_config();
    config.queue_retry_base_ms = 10_000;
    let h = harness(config);
    h.ws.fail_writes(true);

    h.manager.send_message(status("q1")).await.expect("send");
    h.manager.connect().await.expect("connect");

    let deadline = std::time::Instant::now() + WAIT;
    while h.ws.open_attempts() < 2 {
        assert!(std::time::Instant::now() < deadline, "flush failure never reconnected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    wait_for_state(&h.manager, ConnectionState::Connected, WAIT).await;

    // One failed attempt, rescheduled well into the future.
    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.queued_messages, 1);
    assert!(
        health
            .recent_errors
            .iter()
            .any(|e| e.category == ErrorCategory::Network),
        "{:?}",
        health.recent_errors
    );
}

#[tokio::test]
async fn queued_message_is_dropped_after_exhausting_retries() {
    let h = harness(fast_config());
    h.ws.fail_writes(true);

    h.manager.send_message(status("q1")).await.expect("send");
    h.manager.connect().await.expect("connect");

    let dropped = RealtimeError::RetriesExhausted {
        message_id: "q1".to_string(),
        attempts: 3,
    }
    .to_string();
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let health = h.manager.get_connection_health().await.expect("health");
        if health.recent_errors.iter().any(|e| e.message == dropped) {
            assert_eq!(health.queued_messages, 0);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "q1 never exhausted its retries");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Each failed write tore the link down and reopened it.
    assert!(h.ws.open_attempts() >= 3);
}
