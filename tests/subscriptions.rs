mod support;

use std::time::Duration;

use realtime_conn::{ConnectionState, Message, MessageType, SubscriptionFilter};
use support::{WAIT, fast_config, harness};
use tokio::sync::mpsc;

fn collector() -> (
    impl Fn(&Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |msg: &Message| {
        let _ = tx.send(msg.clone());
    }, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap_or_default()
}

#[tokio::test]
async fn messages_fan_out_by_type_and_filter() {
    let mut h = harness(fast_config());
    let (node_cb, mut node_rx) = collector();
    let (all_cb, mut all_rx) = collector();
    h.manager
        .subscribe([MessageType::StatusUpdate], SubscriptionFilter::node("n1"), node_cb)
        .await
        .expect("subscribe node");
    h.manager
        .subscribe(
            [MessageType::StatusUpdate, MessageType::Log],
            SubscriptionFilter::default(),
            all_cb,
        )
        .await
        .expect("subscribe all");

    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");
    server
        .send_text(r#"{"id":"1","type":"status_update","nodeId":"n1","data":{"status":"running"}}"#)
        .expect("send");
    server
        .send_text(r#"{"id":"2","type":"status_update","nodeId":"n2"}"#)
        .expect("send");
    server.send_text(r#"{"id":"3","type":"log","nodeId":"n1"}"#).expect("send");
    server.send_text(r#"{"id":"4","type":"metadata"}"#).expect("send");

    assert_eq!(next(&mut node_rx).await.expect("node").id(), "1");
    assert!(next(&mut node_rx).await.is_none());

    let mut ids = Vec::new();
    while let Some(msg) = next(&mut all_rx).await {
        ids.push(msg.id().to_string());
    }
    assert_eq!(ids, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn malformed_inbound_is_dropped_without_side_effects() {
    let mut h = harness(fast_config());
    let (cb, mut rx) = collector();
    h.manager
        .subscribe(MessageType::ALL, SubscriptionFilter::default(), cb)
        .await
        .expect("subscribe");
    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");

    server.send_text("not json").expect("send");
    server.send_text(r#"{"type":"status_update"}"#).expect("send");
    server.send_text(r#"{"id":"x","type":"teleport"}"#).expect("send");
    server.send_text(r#"{"id":"y","type":"log","data":[1,2]}"#).expect("send");
    server.send_text(r#"{"id":"ok","type":"result"}"#).expect("send");

    assert_eq!(next(&mut rx).await.expect("valid").id(), "ok");
    assert!(next(&mut rx).await.is_none());

    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.state, ConnectionState::Connected);
    assert_eq!(health.total_messages, 1);
    assert_eq!(health.total_errors, 0);
    assert!(health.last_message_at.is_some());
}

#[tokio::test]
async fn failing_subscriber_does_not_starve_the_rest() {
    let mut h = harness(fast_config());
    h.manager
        .subscribe([MessageType::Event], SubscriptionFilter::default(), |_msg: &Message| {
            panic!("subscriber bug")
        })
        .await
        .expect("subscribe failing");
    let (cb, mut rx) = collector();
    h.manager
        .subscribe([MessageType::Event], SubscriptionFilter::default(), cb)
        .await
        .expect("subscribe");

    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");
    server.send_text(r#"{"id":"e1","type":"event"}"#).expect("send");
    server.send_text(r#"{"id":"e2","type":"event"}"#).expect("send");

    assert_eq!(next(&mut rx).await.expect("e1").id(), "e1");
    assert_eq!(next(&mut rx).await.expect("e2").id(), "e2");
    assert_eq!(
        h.manager.state().await.expect("state"),
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let mut h = harness(fast_config());
    let (cb, mut rx) = collector();
    let id = h
        .manager
        .subscribe(
            [MessageType::ProgressUpdate],
            SubscriptionFilter::workflow("wf-1"),
            cb,
        )
        .await
        .expect("subscribe");
    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.active_subscriptions, 1);

    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");
    server
        .send_text(r#"{"id":"p1","type":"progress_update","workflowId":"wf-1","data":{"pct":10}}"#)
        .expect("send");
    assert_eq!(next(&mut rx).await.expect("p1").id(), "p1");

    assert!(h.manager.unsubscribe(id).await.expect("unsubscribe"));
    assert!(!h.manager.unsubscribe(id).await.expect("unsubscribe twice"));
    server
        .send_text(r#"{"id":"p2","type":"progress_update","workflowId":"wf-1"}"#)
        .expect("send");
    assert!(next(&mut rx).await.is_none());

    let health = h.manager.get_connection_health().await.expect("health");
    assert_eq!(health.active_subscriptions, 0);
}

#[tokio::test]
async fn predicate_filters_run_after_type_matching() {
    let mut h = harness(fast_config());
    let (cb, mut rx) = collector();
    let filter = SubscriptionFilter::default().with_predicate(|msg: &Message| msg.version() >= Some(2));
    h.manager
        .subscribe([MessageType::Result], filter, cb)
        .await
        .expect("subscribe");

    h.manager.connect().await.expect("connect");
    let server = h.ws_servers.next_connection(WAIT).await.expect("server");
    server.send_text(r#"{"id":"v1","type":"result","version":1}"#).expect("send");
    server.send_text(r#"{"id":"v2","type":"result","version":2}"#).expect("send");

    assert_eq!(next(&mut rx).await.expect("v2").id(), "v2");
    assert!(next(&mut rx).await.is_none());
}
