//! Connection lifecycle: the actor that owns a connection and the handle callers use.

mod actor;
mod manager;
mod recovery;
mod timers;
mod writer;

use std::sync::Arc;

use crate::core::{ConnectionState, RealtimeError, TransportKind};

pub use manager::{ConnectionManager, ConnectionManagerBuilder, StateListenerHandle};

/// Callback invoked on every state transition, with the error that caused it if any.
pub type StateListener = Arc<dyn Fn(ConnectionState, Option<&RealtimeError>) + Send + Sync>;

/// Result of [`ConnectionManager::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live transport.
    Sent(String),
    /// Held in the offline queue for delivery after (re)connect.
    Queued(String),
}

impl SendOutcome {
    pub fn id(&self) -> &str {
        match self {
            SendOutcome::Sent(id) | SendOutcome::Queued(id) => id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued(_))
    }
}

/// Internal bookkeeping exposed for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSnapshot {
    pub state: ConnectionState,
    pub epoch: u64,
    pub transport: Option<TransportKind>,
    pub last_transport: Option<TransportKind>,
    pub manual_disconnect: bool,
    pub fallback_used: bool,
    /// Live timer tasks (heartbeat, ping timeouts, reconnect, queue retry).
    pub active_timers: usize,
    pub reconnect_scheduled: bool,
    pub heartbeat_running: bool,
    pub pending_pings: Vec<String>,
    pub open_in_flight: bool,
    pub pending_connects: usize,
    pub has_writer: bool,
    pub reconnect_attempts: u32,
}
