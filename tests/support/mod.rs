#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use realtime_conn::testing::{MockServers, MockTransport};
use realtime_conn::{
    ConnectionConfig, ConnectionManager, ConnectionState, DebugSnapshot, RealtimeError,
    TransportKind,
};

pub const WAIT: Duration = Duration::from_secs(2);

/// `RUST_LOG=realtime_conn=debug cargo test` shows the actor's transitions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Millisecond-scale timings so lifecycle tests run in real time.
pub fn fast_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::websocket("ws://mock.test/realtime");
    config.reconnect_interval_ms = 20;
    config.max_reconnect_interval_ms = 80;
    config.reconnect_backoff_multiplier = 2.0;
    config.enable_heartbeat = false;
    config.heartbeat_interval_ms = 50;
    config.heartbeat_timeout_ms = 40;
    config.connection_timeout_ms = 500;
    config.queue_retry_base_ms = 20;
    config.connection_label = "test".to_string();
    config
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub ws: MockTransport,
    pub ws_servers: MockServers,
    pub sse: MockTransport,
    pub sse_servers: MockServers,
}

pub fn harness(config: ConnectionConfig) -> Harness {
    init_tracing();
    let (ws, ws_servers) = MockTransport::new(TransportKind::WebSocket);
    let (sse, sse_servers) = MockTransport::new(TransportKind::EventSource);
    let manager = ConnectionManager::builder(config)
        .transport(ws.shared())
        .transport(sse.shared())
        .build()
        .expect("spawn manager");
    Harness {
        manager,
        ws,
        ws_servers,
        sse,
        sse_servers,
    }
}

pub async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let state = manager.state().await.expect("state");
        if state == want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {want}, still {state}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_snapshot(
    manager: &ConnectionManager,
    timeout: Duration,
    predicate: impl Fn(&DebugSnapshot) -> bool,
) -> DebugSnapshot {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = manager.debug_snapshot().await.expect("debug snapshot");
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for snapshot condition, last: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub type Transitions = Arc<Mutex<Vec<(ConnectionState, Option<RealtimeError>)>>>;

pub async fn record_transitions(manager: &ConnectionManager) -> Transitions {
    let seen: Transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager
        .on_connection_state_change(move |state, err| {
            sink.lock().unwrap().push((state, err.cloned()));
        })
        .await
        .expect("register listener");
    seen
}

pub fn states(transitions: &Transitions) -> Vec<ConnectionState> {
    transitions.lock().unwrap().iter().map(|(s, _)| *s).collect()
}
