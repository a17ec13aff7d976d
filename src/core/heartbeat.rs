use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Result of feeding an inbound heartbeat into the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Pong matched an outstanding ping; carries the round-trip time.
    PongReceived(Duration),
    /// Pong for an id that is not outstanding (already timed out, or never sent).
    UnknownPong,
    /// Remote ping; answer with a pong echoing this id.
    Reply(String),
}

/// Application-level heartbeat state tracking outstanding pings by id.
///
/// Pure bookkeeping: the connection actor owns the interval and per-ping timeout timers and
/// asks the monitor what to do. Matching is by id, so out-of-order pongs are attributed
/// correctly.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    pending: HashMap<String, Instant>,
    last_ping_id: u64,
    last_pong_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            pending: HashMap::new(),
            last_ping_id: 0,
            last_pong_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timing(&mut self, interval: Duration, timeout: Duration) {
        self.interval = interval;
        self.timeout = timeout;
    }

    /// Register a new outgoing ping and return its id.
    ///
    /// Ids are the current epoch milliseconds, bumped past the previous id when two pings
    /// land on the same millisecond.
    pub fn create_ping(&mut self, now: Instant) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or_default();
        let id = millis.max(self.last_ping_id.saturating_add(1));
        self.last_ping_id = id;

        let key = id.to_string();
        self.pending.insert(key.clone(), now);
        key
    }

    pub fn handle_pong(&mut self, ping_id: &str, now: Instant) -> HeartbeatResult {
        match self.pending.remove(ping_id) {
            Some(sent_at) => {
                self.last_pong_at = Some(now);
                HeartbeatResult::PongReceived(now.saturating_duration_since(sent_at))
            }
            None => HeartbeatResult::UnknownPong,
        }
    }

    pub fn handle_ping(&self, ping_id: &str) -> HeartbeatResult {
        HeartbeatResult::Reply(ping_id.to_string())
    }

    /// Retire `ping_id` because its timeout fired.
    ///
    /// Returns `true` only if the ping was still outstanding, so a timeout is reported at
    /// most once per ping.
    pub fn expire(&mut self, ping_id: &str) -> bool {
        self.pending.remove(ping_id).is_some()
    }

    pub fn is_pending(&self, ping_id: &str) -> bool {
        self.pending.contains_key(ping_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
