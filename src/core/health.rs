use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;

use super::circular_buffer::CircularBuffer;
use super::recovery::ErrorCategory;
use super::state::{ConnectionState, TransportKind};

const MAX_RECENT_ERRORS: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;
const LATENCY_WINDOW: usize = 20;

/// One entry of the bounded error history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
}

/// Point-in-time health snapshot handed to collaborators (and UIs via serde).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub total_messages: u64,
    pub queued_messages: usize,
    /// Mean heartbeat round trip over the last 20 samples.
    pub average_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_samples: u64,
    pub active_subscriptions: usize,
    pub total_errors: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

impl ConnectionHealth {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Live counters the actor does not own elsewhere, merged into a [`ConnectionHealth`].
#[derive(Debug, Clone, Copy)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub reconnect_attempts: u32,
    pub queued_messages: usize,
    pub active_subscriptions: usize,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Health bookkeeping owned by the connection actor; no interior mutability.
#[derive(Debug)]
pub struct HealthTracker {
    connected_at: Option<DateTime<Utc>>,
    last_message_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    total_messages: u64,
    total_errors: u64,
    recent_errors: CircularBuffer<ErrorRecord>,
    latency_window: CircularBuffer<Duration>,
    latency_histogram: Histogram<u64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            connected_at: None,
            last_message_at: None,
            last_heartbeat_at: None,
            total_messages: 0,
            total_errors: 0,
            recent_errors: CircularBuffer::new(MAX_RECENT_ERRORS),
            latency_window: CircularBuffer::new(LATENCY_WINDOW),
            // 1us..1000s at 3 significant digits.
            latency_histogram: Histogram::new_with_bounds(1, 1_000_000_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    pub fn record_connected(&mut self, at: DateTime<Utc>) {
        self.connected_at = Some(at);
    }

    pub fn record_disconnected(&mut self) {
        self.connected_at = None;
    }

    pub fn record_message(&mut self, at: DateTime<Utc>) {
        self.last_message_at = Some(at);
        self.total_messages = self.total_messages.saturating_add(1);
    }

    pub fn record_heartbeat(&mut self, at: DateTime<Utc>, rtt: Duration) {
        self.last_heartbeat_at = Some(at);
        self.latency_window.push(rtt);
        let micros = rtt.as_micros().clamp(1, u64::MAX as u128) as u64;
        let _ = self.latency_histogram.saturating_record(micros);
    }

    pub fn record_error(&mut self, category: ErrorCategory, message: &str) {
        self.total_errors = self.total_errors.saturating_add(1);
        self.recent_errors.push(ErrorRecord {
            at: Utc::now(),
            category,
            message: truncate_string(message),
        });
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.recent_errors.iter()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let count = self.latency_window.len() as u32;
        if count == 0 {
            return None;
        }
        let total: Duration = self.latency_window.iter().sum();
        Some(total / count)
    }

    pub fn snapshot(&self, link: LinkStatus) -> ConnectionHealth {
        let samples = self.latency_histogram.len();
        let (p50, p99) = if samples == 0 {
            (0.0, 0.0)
        } else {
            (
                micros_to_ms(self.latency_histogram.value_at_percentile(50.0)),
                micros_to_ms(self.latency_histogram.value_at_percentile(99.0)),
            )
        };

        ConnectionHealth {
            state: link.state,
            transport: link.transport,
            connected_at: self.connected_at,
            last_message_at: self.last_message_at,
            last_heartbeat_at: self.last_heartbeat_at,
            reconnect_attempts: link.reconnect_attempts,
            total_messages: self.total_messages,
            queued_messages: link.queued_messages,
            average_latency_ms: self
                .average_latency()
                .map(|d| d.as_secs_f64() * 1_000.0)
                .unwrap_or(0.0),
            p50_latency_ms: p50,
            p99_latency_ms: p99,
            latency_samples: samples,
            active_subscriptions: link.active_subscriptions,
            total_errors: self.total_errors,
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1_000.0
}
