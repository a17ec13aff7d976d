use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        self, Message as WsMessage, Utf8Bytes,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::CloseFrame as WsCloseFrame,
    },
};
use tracing::debug;

use super::{OpenFuture, OpenRequest, Transport, TransportLink};
use crate::core::{CloseFrame, RealtimeError, TransportFrame, TransportKind};
use crate::tls::install_rustls_crypto_provider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn close_to_core(frame: Option<WsCloseFrame>) -> Option<CloseFrame> {
    frame.map(|f| CloseFrame {
        code: u16::from(f.code),
        reason: f.reason.as_str().to_string(),
    })
}

fn core_to_close(frame: CloseFrame) -> WsCloseFrame {
    WsCloseFrame {
        code: frame.code.into(),
        reason: Utf8Bytes::from(frame.reason),
    }
}

fn msg_to_frame(msg: WsMessage) -> TransportFrame {
    match msg {
        WsMessage::Text(text) => TransportFrame::Text(AsRef::<Bytes>::as_ref(&text).clone()),
        WsMessage::Binary(bytes) => TransportFrame::Binary(bytes),
        WsMessage::Ping(bytes) => TransportFrame::Ping(bytes),
        WsMessage::Pong(bytes) => TransportFrame::Pong(bytes),
        WsMessage::Close(frame) => TransportFrame::Close(close_to_core(frame)),
        WsMessage::Frame(_) => TransportFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: TransportFrame) -> WsMessage {
    match frame {
        TransportFrame::Text(bytes) => match std::str::from_utf8(bytes.as_ref()) {
            Ok(_) => {
                // SAFETY: validated as UTF-8 just above.
                let text = unsafe { Utf8Bytes::from_bytes_unchecked(bytes) };
                WsMessage::Text(text)
            }
            Err(_) => WsMessage::Binary(bytes),
        },
        TransportFrame::Binary(bytes) => WsMessage::Binary(bytes),
        TransportFrame::Ping(bytes) => WsMessage::Ping(bytes),
        TransportFrame::Pong(bytes) => WsMessage::Pong(bytes),
        TransportFrame::Close(frame) => WsMessage::Close(frame.map(core_to_close)),
    }
}

/// Map a handshake failure, keeping the HTTP status as a typed reason when there is one.
fn map_connect_error(err: tungstenite::Error) -> RealtimeError {
    if let tungstenite::Error::Http(response) = &err {
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return RealtimeError::AuthenticationFailed {
                message: format!("websocket handshake rejected: {status}"),
            };
        }
        if status.is_server_error() {
            return RealtimeError::ServerError {
                code: Some(i32::from(status.as_u16())),
                message: format!("websocket handshake failed: {status}"),
            };
        }
    }
    RealtimeError::ConnectionFailed(err.to_string())
}

/// WebSocket transport over tokio-tungstenite. The auth token travels as a bearer header.
#[derive(Clone, Default)]
pub struct WebSocketTransport {
    connector: Option<Connector>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

pub struct WebSocketReader {
    inner: futures_util::stream::SplitStream<WsStream>,
}

impl Stream for WebSocketReader {
    type Item = Result<TransportFrame, RealtimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => {
                Poll::Ready(Some(Err(RealtimeError::transport("read", err))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct WebSocketWriter {
    inner: futures_util::stream::SplitSink<WsStream, WsMessage>,
}

impl Sink<TransportFrame> for WebSocketWriter {
    type Error = RealtimeError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| RealtimeError::transport("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| RealtimeError::transport("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| RealtimeError::transport("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| RealtimeError::transport("write", e))
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn open(&self, request: OpenRequest) -> OpenFuture {
        let connector = self.connector.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut client_request = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| RealtimeError::InvalidConfig(format!("websocket url: {e}")))?;
            if let Some(token) = request.auth_token.as_deref() {
                let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                    RealtimeError::InvalidConfig(format!("auth token is not a valid header: {e}"))
                })?;
                client_request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (stream, response) =
                connect_async_tls_with_config(client_request, None, true, connector)
                    .await
                    .map_err(map_connect_error)?;
            debug!(url = %request.url, status = %response.status(), "websocket handshake complete");

            let (write, read) = stream.split();
            Ok(TransportLink::new(
                Box::pin(WebSocketReader { inner: read }),
                Some(Box::pin(WebSocketWriter { inner: write })),
            ))
        })
    }
}
