use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{RealtimeError, RealtimeResult, TransportFrame, TransportKind};

pub mod sse;
pub mod websocket;

pub use sse::EventSourceTransport;
pub use websocket::WebSocketTransport;

/// Inbound half of an open transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = RealtimeResult<TransportFrame>> + Send>>;

/// Outbound half of an open transport.
pub type FrameSink = Pin<Box<dyn Sink<TransportFrame, Error = RealtimeError> + Send>>;

pub type OpenFuture = Pin<Box<dyn Future<Output = RealtimeResult<TransportLink>> + Send>>;

/// Parameters for a single open attempt.
#[derive(Clone)]
pub struct OpenRequest {
    pub url: String,
    pub auth_token: Option<String>,
    /// Outbound endpoint for transports that cannot write on the receive channel.
    pub post_url: Option<String>,
}

impl fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRequest")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("post_url", &self.post_url)
            .finish()
    }
}

/// An established channel. `writer` is `None` for receive-only transports.
pub struct TransportLink {
    pub reader: FrameStream,
    pub writer: Option<FrameSink>,
}

impl TransportLink {
    pub fn new(reader: FrameStream, writer: Option<FrameSink>) -> Self {
        Self { reader, writer }
    }

    pub fn is_receive_only(&self) -> bool {
        self.writer.is_none()
    }
}

/// Transport boundary.
///
/// The IO loops live outside the connection actor; the actor owns state and policies. The
/// trait is object safe so the manager can hold one implementation per [`TransportKind`] and
/// tests can swap in an in-memory transport.
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    fn open(&self, request: OpenRequest) -> OpenFuture;
}
