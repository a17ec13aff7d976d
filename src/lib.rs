//! Kameo-based realtime connection management over WebSocket and Server-Sent Events.
//!
//! A [`ConnectionManager`] owns one logical connection: transport selection with fallback,
//! backoff reconnects, heartbeats, an offline send queue, typed subscriptions and health
//! reporting. All of it runs on a single connection actor.

pub mod connection;
pub mod core;
pub mod testing;
pub mod tls;
pub mod transport;

pub use connection::{
    ConnectionManager, ConnectionManagerBuilder, DebugSnapshot, SendOutcome, StateListener,
    StateListenerHandle,
};
pub use core::{
    ConnectionConfig, ConnectionHealth, ConnectionState, ErrorCategory, ErrorRecoveryConfig,
    Message, MessageType, OutboundMessage, RealtimeError, RealtimeResult, RecoveryStrategy,
    SubscriptionFilter, SubscriptionId, TransportKind,
};
pub use transport::{EventSourceTransport, Transport, WebSocketTransport};
