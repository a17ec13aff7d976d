//! Server-Sent Events transport.
//!
//! Inbound: a long-lived `GET` whose `text/event-stream` body is split into events; each
//! event's `data` becomes one text frame. EventSource clients cannot set headers, so the
//! auth token rides in the `token` query parameter. Outbound frames are `POST`ed to a
//! separate endpoint when one is configured; otherwise the link is receive-only.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use super::{FrameSink, FrameStream, OpenFuture, OpenRequest, Transport, TransportLink};
use crate::core::{RealtimeError, RealtimeResult, TransportFrame, TransportKind};
use crate::tls::install_rustls_crypto_provider;

/// Incremental `text/event-stream` decoder.
///
/// Buffers partial lines across chunks, joins multi-line `data:` fields with `\n` and emits
/// one payload per blank-line terminated event. Comments and `event:`/`id:`/`retry:` fields
/// are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            data: None,
        }
    }

    /// Feed a chunk, appending every completed event payload to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut VecDeque<String>) {
        self.buffer.extend_from_slice(chunk);
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline_pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            match std::str::from_utf8(&line) {
                Ok(line) => self.process_line(line, out),
                Err(_) => warn!("skipping non UTF-8 event-stream line"),
            }
        }
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self, out: &mut VecDeque<String>) {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&rest) {
                self.process_line(line.trim_end_matches('\r'), out);
            }
        }
        self.dispatch(out);
    }

    fn process_line(&mut self, line: &str, out: &mut VecDeque<String>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
    }

    fn dispatch(&mut self, out: &mut VecDeque<String>) {
        if let Some(data) = self.data.take()
            && !data.is_empty()
        {
            out.push_back(data);
        }
    }
}

/// Turn a chunked body into a stream of text frames.
fn event_frames<S>(body: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    let stream = futures_util::stream::unfold(
        (body, SseDecoder::new(), VecDeque::new(), false),
        |(mut body, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(data) = pending.pop_front() {
                    let frame = Ok(TransportFrame::Text(Bytes::from(data)));
                    return Some((frame, (body, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk, &mut pending),
                    Some(Err(err)) => {
                        done = true;
                        let err = RealtimeError::transport("event-stream read", err);
                        return Some((Err(err), (body, decoder, pending, done)));
                    }
                    None => {
                        decoder.finish(&mut pending);
                        done = true;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

fn status_error(status: StatusCode, context: &str) -> RealtimeError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RealtimeError::AuthenticationFailed {
            message: format!("{context} rejected: {status}"),
        }
    } else if status.is_server_error() {
        RealtimeError::ServerError {
            code: Some(i32::from(status.as_u16())),
            message: format!("{context} failed: {status}"),
        }
    } else {
        RealtimeError::ConnectionFailed(format!("{context} failed: {status}"))
    }
}

fn stream_url(url: &str, token: Option<&str>) -> RealtimeResult<Url> {
    let mut url = Url::parse(url)
        .map_err(|e| RealtimeError::InvalidConfig(format!("event-source url: {e}")))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

type PostFuture = Pin<Box<dyn Future<Output = RealtimeResult<()>> + Send>>;

/// Outbound half: one `POST` per application frame. Control frames have no meaning here.
///
/// At most one request is in flight. A failed request is reported once from
/// `poll_ready`/`poll_flush` and the sink stays usable for the next frame.
struct PostSink {
    client: Client,
    url: String,
    token: Option<String>,
    in_flight: Option<PostFuture>,
}

impl PostSink {
    fn new(client: Client, url: String, token: Option<String>) -> Self {
        Self {
            client,
            url,
            token,
            in_flight: None,
        }
    }

    fn post(&self, body: Bytes) -> PostFuture {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| RealtimeError::transport("event-source post", e))?;
            if !response.status().is_success() {
                return Err(status_error(response.status(), "event-source post"));
            }
            Ok(())
        })
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<RealtimeResult<()>> {
        let Some(request) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(request.as_mut().poll(cx));
        self.in_flight = None;
        Poll::Ready(result)
    }
}

impl Sink<TransportFrame> for PostSink {
    type Error = RealtimeError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn start_send(self: Pin<&mut Self>, frame: TransportFrame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        match frame {
            TransportFrame::Text(body) | TransportFrame::Binary(body) => {
                this.in_flight = Some(this.post(body));
            }
            TransportFrame::Ping(_) | TransportFrame::Pong(_) | TransportFrame::Close(_) => {}
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }
}

fn post_sink(client: Client, url: String, token: Option<String>) -> FrameSink {
    Box::pin(PostSink::new(client, url, token))
}

/// SSE transport over reqwest streaming.
#[derive(Clone)]
pub struct EventSourceTransport {
    client: Client,
}

impl EventSourceTransport {
    pub fn new() -> RealtimeResult<Self> {
        install_rustls_crypto_provider();
        let client = Client::builder()
            .build()
            .map_err(|e| RealtimeError::transport("http client", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for EventSourceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventSource
    }

    fn open(&self, request: OpenRequest) -> OpenFuture {
        let client = self.client.clone();
        Box::pin(async move {
            let url = stream_url(&request.url, request.auth_token.as_deref())?;
            let response = client
                .get(url)
                .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
                .send()
                .await
                .map_err(|e| RealtimeError::ConnectionFailed(format!("event-source: {e}")))?;
            if !response.status().is_success() {
                return Err(status_error(response.status(), "event-source"));
            }
            debug!(url = %request.url, status = %response.status(), "event stream open");

            let reader = event_frames(Box::pin(response.bytes_stream()));
            let writer = request
                .post_url
                .map(|post_url| post_sink(client, post_url, request.auth_token));
            Ok(TransportLink::new(reader, writer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Vec<String> {
        let mut decoder = SseDecoder::new();
        let mut out = VecDeque::new();
        for chunk in chunks {
            decoder.push(chunk.as_bytes(), &mut out);
        }
        decoder.finish(&mut out);
        out.into_iter().collect()
    }

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let events = decode_all(&["data: {\"id\":", "\"1\"}\n\n", "data: {\"id\":\"2\"}\r\n\r\n"]);
        assert_eq!(events, vec![r#"{"id":"1"}"#, r#"{"id":"2"}"#]);
    }

    #[test]
    fn multi_line_data_is_joined_and_other_fields_ignored() {
        let events = decode_all(&[": keepalive\n", "event: message\nid: 7\ndata: a\ndata: b\n\n"]);
        assert_eq!(events, vec!["a\nb"]);
    }

    #[test]
    fn trailing_event_without_blank_line_is_flushed() {
        let events = decode_all(&["data:x"]);
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn empty_events_are_dropped() {
        assert!(decode_all(&["data:\n\n", "\n\n"]).is_empty());
    }

    #[test]
    fn token_is_appended_as_query_parameter() {
        let url = stream_url("https://example.test/events?stream=jobs", Some("a b")).expect("url");
        assert_eq!(url.as_str(), "https://example.test/events?stream=jobs&token=a+b");
        assert!(stream_url("not a url", None).is_err());
    }

    #[test]
    fn status_codes_map_to_typed_errors() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "x"),
            RealtimeError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "x"),
            RealtimeError::ServerError { code: Some(502), .. }
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "x"),
            RealtimeError::ConnectionFailed(_)
        ));
    }

    #[tokio::test]
    async fn failed_post_leaves_the_sink_usable() {
        use futures_util::SinkExt;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}/send", listener.local_addr().expect("addr"));
        drop(listener);

        let mut sink = post_sink(Client::new(), url, Some("tok".to_string()));
        let first = sink.send(TransportFrame::text(r#"{"id":"1"}"#)).await;
        assert!(matches!(first, Err(RealtimeError::TransportError { .. })), "{first:?}");
        let second = sink.send(TransportFrame::text(r#"{"id":"2"}"#)).await;
        assert!(matches!(second, Err(RealtimeError::TransportError { .. })), "{second:?}");

        // Control frames never reach the network.
        sink.send(TransportFrame::Ping(Bytes::new())).await.expect("ping is a no-op");
    }
}
