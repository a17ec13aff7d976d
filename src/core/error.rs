use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for connection operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Canonical error surface shared across the connection manager.
///
/// Errors are `Clone` so a single failure can be handed to state listeners,
/// recorded in the health history and returned to a pending `connect()` caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RealtimeError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Heartbeat timeout: no pong for ping {ping_id} within {timeout:?}")]
    HeartbeatTimeout { ping_id: String, timeout: Duration },

    #[error("Connection closed by remote: code={code:?}, reason={reason}")]
    RemoteClosed { code: Option<u16>, reason: String },

    #[error("Server error: code={code:?}, message={message}")]
    ServerError { code: Option<i32>, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No transport available: no usable websocket or event-source URL configured")]
    NoTransportAvailable,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Message {message_id} dropped after {attempts} failed delivery attempts")]
    RetriesExhausted { message_id: String, attempts: u32 },

    #[error("Message {message_id} expired in the offline queue after {age:?}")]
    QueueExpired { message_id: String, age: Duration },

    #[error("Disconnected before the connection was established")]
    Disconnected,

    #[error("Actor error: {0}")]
    ActorError(String),
}

impl RealtimeError {
    pub(crate) fn transport(context: &'static str, err: impl ToString) -> Self {
        Self::TransportError {
            context,
            error: err.to_string(),
        }
    }

    /// Whether the error describes the loss or failure of the transport itself.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RealtimeError::ConnectionFailed(_)
                | RealtimeError::AuthenticationFailed { .. }
                | RealtimeError::TransportError { .. }
                | RealtimeError::Timeout { .. }
                | RealtimeError::HeartbeatTimeout { .. }
                | RealtimeError::RemoteClosed { .. }
                | RealtimeError::ServerError { .. }
        )
    }
}
