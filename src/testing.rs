//! Reusable test utilities for driving a [`ConnectionManager`](crate::ConnectionManager)
//! without a real network.
//!
//! [`MockTransport::new`] returns a transport to hand to the manager builder plus a
//! [`MockServers`] handle. Every successful open produces one [`MockServer`], which tests
//! use to read outbound frames, push inbound frames, close or drop the socket, and make
//! writes fail. Open outcomes can be scripted ahead of time.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures_util::Sink;
use tokio::sync::mpsc;

use crate::core::{
    Message, MessageCodec, RealtimeError, RealtimeResult, TransportFrame, TransportKind,
};
use crate::transport::{OpenFuture, OpenRequest, Transport, TransportLink};

/// Scripted result of one open attempt. An empty script accepts.
#[derive(Debug, Clone)]
pub enum OpenScript {
    Accept,
    Fail(RealtimeError),
    /// Accept after a pause, keeping the attempt in flight.
    Delay(Duration),
    /// Never resolve, so the connection timeout fires.
    Hang,
}

struct MockState {
    kind: TransportKind,
    receive_only: bool,
    script: Mutex<VecDeque<OpenScript>>,
    requests: Mutex<Vec<OpenRequest>>,
    opens: AtomicUsize,
    fail_writes: AtomicBool,
    servers_tx: mpsc::UnboundedSender<MockServer>,
}

/// In-memory transport for one [`TransportKind`].
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> (Self, MockServers) {
        Self::build(kind, false)
    }

    /// A transport whose links have no outbound half, like SSE without a POST endpoint.
    pub fn receive_only(kind: TransportKind) -> (Self, MockServers) {
        Self::build(kind, true)
    }

    fn build(kind: TransportKind, receive_only: bool) -> (Self, MockServers) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(MockState {
                kind,
                receive_only,
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
                servers_tx,
            }),
        };
        (transport, MockServers { servers_rx })
    }

    /// Queue the outcome of the next open attempt.
    pub fn script(&self, outcome: OpenScript) {
        lock(&self.state.script).push_back(outcome);
    }

    pub fn fail_next_opens(&self, count: usize, error: RealtimeError) {
        let mut script = lock(&self.state.script);
        for _ in 0..count {
            script.push_back(OpenScript::Fail(error.clone()));
        }
    }

    /// Make client writes fail on every connection opened from now on.
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of open attempts so far, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OpenRequest> {
        lock(&self.state.requests).clone()
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.state.kind
    }

    fn open(&self, request: OpenRequest) -> OpenFuture {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            state.opens.fetch_add(1, Ordering::SeqCst);
            lock(&state.requests).push(request);
            let outcome = lock(&state.script).pop_front().unwrap_or(OpenScript::Accept);
            match outcome {
                OpenScript::Accept => {}
                OpenScript::Delay(delay) => tokio::time::sleep(delay).await,
                OpenScript::Fail(err) => return Err(err),
                OpenScript::Hang => std::future::pending::<()>().await,
            }

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let fail_writes = Arc::new(AtomicBool::new(state.fail_writes.load(Ordering::SeqCst)));
            let writer = if state.receive_only {
                None
            } else {
                Some(Box::pin(MockWriter {
                    sent_tx: outbound_tx,
                    fail_writes: Arc::clone(&fail_writes),
                }) as crate::transport::FrameSink)
            };
            let server = MockServer {
                outbound_rx,
                inbound_tx: Some(inbound_tx),
                fail_writes,
            };
            state.servers_tx.send(server).map_err(|_| {
                RealtimeError::InvalidState("mock server handle was dropped".to_string())
            })?;
            Ok(TransportLink::new(Box::pin(MockReader { rx: inbound_rx }), writer))
        })
    }
}

/// Receives one [`MockServer`] per accepted connection, in open order.
pub struct MockServers {
    servers_rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockServers {
    pub async fn next_connection(&mut self, timeout: Duration) -> Option<MockServer> {
        tokio::time::timeout(timeout, self.servers_rx.recv())
            .await
            .unwrap_or_default()
    }
}

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer receiving inbound frames.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server side of one mock connection.
pub struct MockServer {
    outbound_rx: mpsc::UnboundedReceiver<TransportFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<RealtimeResult<TransportFrame>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockServer {
    /// Receive a frame written by the client, or `None` after `timeout`.
    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<TransportFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Receive and decode the next application message written by the client.
    pub async fn recv_message(&mut self, timeout: Duration) -> Option<Message> {
        loop {
            let frame = self.recv_outbound_timeout(timeout).await?;
            if let Some(data) = frame.data()
                && let Ok(message) = MessageCodec.decode(data, Utc::now())
            {
                return Some(message);
            }
        }
    }

    pub fn send_frame(&self, frame: TransportFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockServerError> {
        self.send_frame(TransportFrame::text(text.as_ref()))
    }

    pub fn send_message(&self, message: &Message) -> Result<(), MockServerError> {
        let frame = MessageCodec
            .encode(message)
            .map_err(|_| MockServerError::ChannelClosed)?;
        self.send_frame(frame)
    }

    /// Deliver a read error to the client, as a broken socket would.
    pub fn send_error(&self, error: RealtimeError) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(error)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<(), MockServerError> {
        self.send_frame(TransportFrame::close(code, reason))
    }

    /// Simulate a server-side drop: the client sees the stream end without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Make every subsequent client write on this connection fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether the client has released the inbound side of this connection.
    pub fn is_client_gone(&self) -> bool {
        self.inbound_tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<RealtimeResult<TransportFrame>>,
}

impl futures_util::Stream for MockReader {
    type Item = RealtimeResult<TransportFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

struct MockWriter {
    sent_tx: mpsc::UnboundedSender<TransportFrame>,
    fail_writes: Arc<AtomicBool>,
}

impl Sink<TransportFrame> for MockWriter {
    type Error = RealtimeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: TransportFrame) -> Result<(), Self::Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RealtimeError::TransportError {
                context: "mock write",
                error: "connection reset".to_string(),
            });
        }
        self.sent_tx
            .send(item)
            .map_err(|_| RealtimeError::TransportError {
                context: "mock write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
