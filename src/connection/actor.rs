//! Connection actor.
//!
//! The transport IO loops run outside kameo (a reader task and a writer actor); this actor
//! owns the connection state, the offline queue, the subscription registry, health and every
//! timer, and receives frames, open results and timer ticks as messages. Each open attempt
//! and each teardown bumps `epoch`; messages stamped with an older epoch are ignored.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::timers::{self, TimerKey, TimerSet};
use super::writer::{CloseSink, WriteFrame, WriterActor};
use super::{DebugSnapshot, SendOutcome, StateListener};
use crate::core::subscription::panic_message;
use crate::core::{
    CloseFrame, ConnectionConfig, ConnectionHealth, ConnectionState, FlushReport,
    HealthTracker, HeartbeatMonitor, HeartbeatResult, LinkStatus, Message, MessageCallback,
    MessageCodec, MessageType, OfflineQueue, OutboundMessage, RealtimeError, RealtimeResult,
    ReconnectBackoff, SubscriptionFilter, SubscriptionId, SubscriptionRegistry, TransportFrame,
    TransportKind, classify_error,
};
use crate::transport::{FrameStream, OpenRequest, Transport, TransportLink};

pub(crate) type TransportMap = HashMap<TransportKind, Arc<dyn Transport>>;

pub(crate) fn map_send_error<M, E>(err: kameo::error::SendError<M, E>) -> RealtimeError
where
    E: Into<RealtimeError>,
{
    match err {
        kameo::error::SendError::HandlerError(err) => err.into(),
        _ => RealtimeError::ActorError("actor is not running".to_string()),
    }
}

pub(crate) async fn write_message(
    writer: &ActorRef<WriterActor>,
    codec: MessageCodec,
    message: &Message,
    timeout: Duration,
) -> RealtimeResult<()> {
    let frame = codec.encode(message)?;
    match tokio::time::timeout(timeout, writer.ask(WriteFrame { frame })).await {
        // A writer that has stopped means the link is gone.
        Ok(result) => result.map_err(|err| match map_send_error(err) {
            RealtimeError::ActorError(reason) => {
                RealtimeError::transport("writer", format!("connection closed: {reason}"))
            }
            other => other,
        }),
        Err(_) => Err(RealtimeError::Timeout {
            context: format!("write of message {} did not complete within {timeout:?}", message.id()),
        }),
    }
}

pub(crate) struct ConnectionActorArgs {
    pub(crate) config: ConnectionConfig,
    pub(crate) transports: TransportMap,
}

pub(crate) struct ConnectionActor {
    pub(super) config: ConnectionConfig,
    transports: TransportMap,
    pub(super) actor_ref: ActorRef<Self>,
    pub(super) state: ConnectionState,
    pub(super) epoch: u64,
    /// Kind of the most recent open attempt; survives teardown so fallback knows what failed.
    pub(super) last_transport: Option<TransportKind>,
    active_transport: Option<TransportKind>,
    writer_ref: Option<ActorRef<WriterActor>>,
    reader_task: Option<JoinHandle<()>>,
    open_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    pub(super) timers: TimerSet,
    waiters: Vec<oneshot::Sender<RealtimeResult<()>>>,
    pub(super) manual_disconnect: bool,
    pub(super) fallback_used: bool,
    closed: bool,
    pub(super) backoff: ReconnectBackoff,
    heartbeat: HeartbeatMonitor,
    queue: OfflineQueue,
    registry: SubscriptionRegistry,
    pub(super) health: HealthTracker,
    listeners: BTreeMap<u64, StateListener>,
    next_listener_id: u64,
    codec: MessageCodec,
}

impl Actor for ConnectionActor {
    type Args = ConnectionActorArgs;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        let ConnectionActorArgs { config, transports } = args;
        config.validate()?;

        let backoff = ReconnectBackoff::new(
            config.reconnect_interval(),
            config.max_reconnect_interval(),
            config.reconnect_backoff_multiplier,
            config.max_reconnect_attempts,
        );
        let heartbeat = HeartbeatMonitor::new(config.heartbeat_interval(), config.heartbeat_timeout());
        let queue = OfflineQueue::new(config.queue_config());
        debug!(
            connection = %config.connection_label,
            transports = ?transports.keys().collect::<Vec<_>>(),
            "connection actor started"
        );

        Ok(Self {
            config,
            transports,
            actor_ref,
            state: ConnectionState::Disconnected,
            epoch: 0,
            last_transport: None,
            active_transport: None,
            writer_ref: None,
            reader_task: None,
            open_task: None,
            shutdown_tx: None,
            timers: TimerSet::default(),
            waiters: Vec::new(),
            manual_disconnect: false,
            fallback_used: false,
            closed: false,
            backoff,
            heartbeat,
            queue,
            registry: SubscriptionRegistry::new(),
            health: HealthTracker::new(),
            listeners: BTreeMap::new(),
            next_listener_id: 0,
            codec: MessageCodec,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> RealtimeResult<()> {
        self.timers.cancel_all();
        self.teardown_transport();
        self.reject_waiters(&RealtimeError::InvalidState(
            "connection actor stopped".to_string(),
        ));
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "ConnectionActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

impl ConnectionActor {
    pub(super) fn label(&self) -> &str {
        &self.config.connection_label
    }

    /// Transition and notify listeners. Re-setting the current state is a no-op.
    pub(super) fn set_state(&mut self, next: ConnectionState, error: Option<&RealtimeError>) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        info!(
            connection = %self.label(),
            from = %previous,
            to = %next,
            error = error.map(tracing::field::display),
            "connection state changed"
        );
        for (id, listener) in &self.listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(next, error))) {
                warn!(
                    connection = %self.config.connection_label,
                    listener = id,
                    panic = %panic_message(panic.as_ref()),
                    "state listener failed"
                );
            }
        }
    }

    /// Record an error in the health history without running recovery.
    pub(super) fn note_error(&mut self, error: &RealtimeError) {
        self.health.record_error(classify_error(error), &error.to_string());
    }

    fn resolve_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn reject_waiters(&mut self, error: &RealtimeError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    pub(super) fn transport_for(&self, kind: TransportKind) -> Option<(Arc<dyn Transport>, String)> {
        let url = self.config.url_for(kind)?;
        let transport = self.transports.get(&kind)?;
        Some((Arc::clone(transport), url.to_string()))
    }

    /// Preferred kind first, then the other one when fallback is allowed.
    fn select_transport(&self) -> RealtimeResult<(TransportKind, Arc<dyn Transport>, String)> {
        let preferred = self.config.preferred_type;
        let mut candidates = vec![preferred];
        if self.config.fallback_to_secondary {
            candidates.push(preferred.other());
        }
        candidates
            .into_iter()
            .find_map(|kind| {
                self.transport_for(kind)
                    .map(|(transport, url)| (kind, transport, url))
            })
            .ok_or(RealtimeError::NoTransportAvailable)
    }

    /// Open the best available transport, or fail every waiter immediately.
    pub(super) fn start_connect(&mut self) {
        match self.select_transport() {
            Ok((kind, transport, url)) => self.begin_open(kind, transport, url),
            Err(err) => {
                warn!(connection = %self.label(), error = %err, "no usable transport configured");
                self.note_error(&err);
                self.reject_waiters(&err);
                if self.state != ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Error, Some(&err));
                }
            }
        }
    }

    pub(super) fn begin_open(&mut self, kind: TransportKind, transport: Arc<dyn Transport>, url: String) {
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        self.timers.cancel(&TimerKey::Reconnect);
        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.last_transport = Some(kind);

        let request = OpenRequest {
            url,
            auth_token: self.config.auth_token.clone(),
            post_url: match kind {
                TransportKind::EventSource => self.config.event_source_post_url.clone(),
                TransportKind::WebSocket => None,
            },
        };
        info!(
            connection = %self.label(),
            transport = %kind,
            url = %request.url,
            epoch,
            attempt = self.backoff.attempts(),
            "opening transport"
        );
        self.set_state(ConnectionState::Connecting, None);

        let timeout = self.config.connection_timeout();
        let actor_ref = self.actor_ref.clone();
        self.open_task = Some(tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, transport.open(request)).await {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::Timeout {
                    context: format!("{kind} open did not complete within {timeout:?}"),
                }),
            };
            match outcome {
                Ok(link) => {
                    let _ = actor_ref
                        .tell(TransportOpened { epoch, kind, link })
                        .send()
                        .await;
                }
                Err(error) => {
                    let _ = actor_ref
                        .tell(TransportFailed { epoch, kind, error })
                        .send()
                        .await;
                }
            }
        }));
    }

    /// Drop everything scoped to the current transport: IO tasks, writer, heartbeat and
    /// queue-retry timers, outstanding pings. Bumps the epoch so in-flight events are stale.
    pub(super) fn teardown_transport(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.timers.cancel_where(TimerKey::is_connection_scoped);
        self.heartbeat.reset();
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(writer) = self.writer_ref.take() {
            tokio::spawn(async move {
                let _ = writer.tell(CloseSink).send().await;
                let _ = writer.stop_gracefully().await;
            });
        }
        if self.active_transport.take().is_some() {
            self.health.record_disconnected();
        }
    }

    async fn on_transport_opened(&mut self, kind: TransportKind, link: TransportLink) {
        self.open_task = None;
        let receive_only = link.is_receive_only();
        let TransportLink { reader, writer } = link;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(sink) = writer {
            self.writer_ref = Some(WriterActor::spawn(WriterActor::new(sink, shutdown_rx.clone())));
        }
        self.reader_task = Some(spawn_reader(
            self.actor_ref.clone(),
            self.epoch,
            reader,
            shutdown_rx,
        ));
        self.shutdown_tx = Some(shutdown_tx);
        self.active_transport = Some(kind);

        self.backoff.reset();
        self.fallback_used = false;
        self.heartbeat.reset();
        self.health.record_connected(Utc::now());
        info!(
            connection = %self.label(),
            transport = %kind,
            receive_only,
            "connection established"
        );
        self.set_state(ConnectionState::Connected, None);
        self.resolve_waiters();

        if !self.config.enable_heartbeat {
            debug!(connection = %self.label(), "heartbeat disabled");
        } else if receive_only {
            debug!(connection = %self.label(), "heartbeat skipped on receive-only transport");
        } else {
            self.start_heartbeat();
        }

        self.flush_offline_queue().await;
    }

    fn start_heartbeat(&mut self) {
        let epoch = self.epoch;
        let interval = self.heartbeat.interval();
        let handle = timers::every(&self.actor_ref, interval, move || HeartbeatTick { epoch });
        self.timers.arm(TimerKey::Heartbeat, handle);
    }

    /// Tear down and run the recovery pipeline. When no strategy moved the state, a clean
    /// remote close ends in `Closed` and anything else in `Error`. Pending connect callers
    /// are rejected unless recovery started another open.
    pub(super) async fn handle_connection_loss(&mut self, error: RealtimeError, clean: bool) {
        warn!(
            connection = %self.label(),
            state = %self.state,
            transport = ?self.last_transport,
            error = %error,
            clean,
            "connection lost"
        );
        self.teardown_transport();
        if !self.run_recovery(&error) {
            let terminal = if clean {
                ConnectionState::Closed
            } else {
                ConnectionState::Error
            };
            self.set_state(terminal, Some(&error));
        }
        // A fallback open keeps pending connect() callers waiting on its outcome.
        if self.state != ConnectionState::Connecting {
            self.reject_waiters(&error);
        }
    }

    async fn handle_inbound(&mut self, frame: TransportFrame) {
        let payload = match frame {
            TransportFrame::Text(bytes) | TransportFrame::Binary(bytes) => bytes,
            TransportFrame::Ping(_) | TransportFrame::Pong(_) => return,
            TransportFrame::Close(close) => {
                self.handle_transport_closed(CloseCause::Frame(close)).await;
                return;
            }
        };
        if self.config.verbose_logging {
            trace!(connection = %self.label(), len = payload.len(), "inbound frame");
        }

        let message = match self.codec.decode(&payload, Utc::now()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    connection = %self.label(),
                    error = %err,
                    len = payload.len(),
                    "dropping malformed inbound message"
                );
                return;
            }
        };
        self.health.record_message(message.timestamp());

        match message.kind() {
            MessageType::Pong => self.handle_pong(&message),
            MessageType::Ping => self.answer_ping(&message).await,
            _ => {
                let report = self.registry.dispatch(&message);
                if self.config.verbose_logging {
                    trace!(
                        connection = %self.label(),
                        message_id = %message.id(),
                        message_type = %message.kind(),
                        delivered = report.delivered,
                        failed = report.failed,
                        "message dispatched"
                    );
                }
            }
        }
    }

    fn handle_pong(&mut self, message: &Message) {
        let Some(ping_id) = message.ping_id().map(str::to_string) else {
            debug!(connection = %self.label(), message_id = %message.id(), "pong without ping id");
            return;
        };
        match self.heartbeat.handle_pong(&ping_id, Instant::now()) {
            HeartbeatResult::PongReceived(rtt) => {
                self.timers.cancel(&TimerKey::PingTimeout(ping_id.clone()));
                self.health.record_heartbeat(Utc::now(), rtt);
                debug!(
                    connection = %self.label(),
                    ping_id = %ping_id,
                    rtt_us = rtt.as_micros() as u64,
                    "heartbeat pong"
                );
            }
            HeartbeatResult::UnknownPong | HeartbeatResult::Reply(_) => {
                debug!(connection = %self.label(), ping_id = %ping_id, "pong for unknown ping");
            }
        }
    }

    async fn answer_ping(&mut self, message: &Message) {
        let Some(ping_id) = message.ping_id() else {
            return;
        };
        let HeartbeatResult::Reply(ping_id) = self.heartbeat.handle_ping(ping_id) else {
            return;
        };
        let Some(writer) = self.writer_ref.clone() else {
            debug!(connection = %self.label(), "cannot answer ping on receive-only transport");
            return;
        };
        let pong = Message::pong(&ping_id);
        if let Err(err) =
            write_message(&writer, self.codec, &pong, self.config.connection_timeout()).await
        {
            self.handle_connection_loss(err, false).await;
        }
    }

    async fn handle_heartbeat_tick(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(writer) = self.writer_ref.clone() else {
            return;
        };
        let ping_id = self.heartbeat.create_ping(Instant::now());
        let timeout_msg = HeartbeatTimeout {
            epoch: self.epoch,
            ping_id: ping_id.clone(),
        };
        let handle = timers::after(&self.actor_ref, self.heartbeat.timeout(), timeout_msg);
        self.timers.arm(TimerKey::PingTimeout(ping_id.clone()), handle);
        debug!(connection = %self.label(), ping_id = %ping_id, "sending heartbeat ping");

        let ping = Message::ping(&ping_id);
        if let Err(err) =
            write_message(&writer, self.codec, &ping, self.config.connection_timeout()).await
        {
            self.handle_connection_loss(err, false).await;
        }
    }

    async fn handle_heartbeat_timeout(&mut self, ping_id: String) {
        self.timers.forget(&TimerKey::PingTimeout(ping_id.clone()));
        if !self.heartbeat.expire(&ping_id) {
            return;
        }
        let error = RealtimeError::HeartbeatTimeout {
            ping_id,
            timeout: self.heartbeat.timeout(),
        };
        self.handle_connection_loss(error, false).await;
    }

    async fn handle_transport_closed(&mut self, cause: CloseCause) {
        let (error, clean) = match cause {
            CloseCause::Frame(Some(CloseFrame { code, reason })) => (
                RealtimeError::RemoteClosed {
                    code: Some(code),
                    reason,
                },
                code == 1000 || code == 1001,
            ),
            CloseCause::Frame(None) => (
                RealtimeError::RemoteClosed {
                    code: None,
                    reason: "closed without status".to_string(),
                },
                true,
            ),
            CloseCause::Ended => (
                RealtimeError::RemoteClosed {
                    code: None,
                    reason: "stream ended".to_string(),
                },
                false,
            ),
            CloseCause::Error(error) => (error, false),
        };
        self.handle_connection_loss(error, clean).await;
    }

    /// Queue `message` for later delivery. Returns `false` when the queue is disabled.
    fn enqueue_offline(&mut self, message: Message) -> bool {
        if !self.config.enable_offline_queue {
            return false;
        }
        let now = Instant::now();
        for expired in self.queue.sweep_expired(now) {
            self.note_error(&expired);
        }
        self.queue.enqueue(message, now);
        true
    }

    async fn send_message(&mut self, outbound: OutboundMessage) -> RealtimeResult<SendOutcome> {
        if self.closed {
            return Err(RealtimeError::InvalidState(
                "connection manager has been shut down".to_string(),
            ));
        }
        let message = outbound.into_message(Utc::now());
        let id = message.id().to_string();

        if self.state == ConnectionState::Connected {
            if let Some(writer) = self.writer_ref.clone() {
                let timeout = self.config.connection_timeout();
                return match write_message(&writer, self.codec, &message, timeout).await {
                    Ok(()) => {
                        if self.config.verbose_logging {
                            trace!(connection = %self.label(), message_id = %id, "message sent");
                        }
                        Ok(SendOutcome::Sent(id))
                    }
                    Err(err) => {
                        warn!(
                            connection = %self.label(),
                            message_id = %id,
                            error = %err,
                            "direct send failed"
                        );
                        let queued = self.enqueue_offline(message);
                        self.handle_connection_loss(err.clone(), false).await;
                        if queued {
                            Ok(SendOutcome::Queued(id))
                        } else {
                            Err(err)
                        }
                    }
                };
            }
            if !self.enqueue_offline(message) {
                return Err(RealtimeError::Unsupported(
                    "active transport is receive-only".to_string(),
                ));
            }
            return Ok(SendOutcome::Queued(id));
        }

        if self.enqueue_offline(message) {
            Ok(SendOutcome::Queued(id))
        } else {
            Err(RealtimeError::NotConnected)
        }
    }

    /// Deliver due queue entries over the live writer and re-arm the retry timer.
    pub(super) async fn flush_offline_queue(&mut self) -> FlushReport {
        let now = Instant::now();
        let writer = match self.writer_ref.clone() {
            Some(writer) if self.state == ConnectionState::Connected => writer,
            _ => {
                let expired = self.queue.sweep_expired(now);
                for err in &expired {
                    self.note_error(err);
                }
                return FlushReport {
                    expired,
                    ..FlushReport::default()
                };
            }
        };
        if self.queue.is_empty() {
            self.timers.cancel(&TimerKey::QueueRetry);
            return FlushReport::default();
        }

        let codec = self.codec;
        let timeout = self.config.connection_timeout();
        let report = self
            .queue
            .flush(now, |message| {
                let writer = writer.clone();
                async move { write_message(&writer, codec, &message, timeout).await }
            })
            .await;

        for err in report.failures() {
            self.health.record_error(classify_error(err), &err.to_string());
        }
        info!(
            connection = %self.label(),
            sent = report.sent.len(),
            retried = report.retried,
            dropped = report.dropped.len(),
            expired = report.expired.len(),
            remaining = self.queue.len(),
            interrupted = report.interrupted.is_some(),
            "offline queue flushed"
        );
        match report.interrupted.clone() {
            // The next open flushes again and re-arms the retry timer.
            Some(err) => self.handle_connection_loss(err, false).await,
            None => self.arm_queue_retry(),
        }
        report
    }

    fn arm_queue_retry(&mut self) {
        match self.queue.next_due_at() {
            Some(due) => {
                let delay = due.saturating_duration_since(Instant::now());
                let handle = timers::after(
                    &self.actor_ref,
                    delay,
                    QueueRetryDue { epoch: self.epoch },
                );
                self.timers.arm(TimerKey::QueueRetry, handle);
            }
            None => {
                self.timers.cancel(&TimerKey::QueueRetry);
            }
        }
    }

    fn health_snapshot(&mut self) -> ConnectionHealth {
        for expired in self.queue.sweep_expired(Instant::now()) {
            self.note_error(&expired);
        }
        self.health.snapshot(LinkStatus {
            state: self.state,
            transport: self.active_transport,
            reconnect_attempts: self.backoff.attempts(),
            queued_messages: self.queue.len(),
            active_subscriptions: self.registry.len(),
        })
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            state: self.state,
            epoch: self.epoch,
            transport: self.active_transport,
            last_transport: self.last_transport,
            manual_disconnect: self.manual_disconnect,
            fallback_used: self.fallback_used,
            active_timers: self.timers.active(),
            reconnect_scheduled: self.timers.is_armed(&TimerKey::Reconnect),
            heartbeat_running: self.timers.is_armed(&TimerKey::Heartbeat),
            pending_pings: self.heartbeat.pending_ids(),
            open_in_flight: self.open_task.as_ref().is_some_and(|t| !t.is_finished()),
            pending_connects: self.waiters.len(),
            has_writer: self.writer_ref.is_some(),
            reconnect_attempts: self.backoff.attempts(),
        }
    }

    fn apply_config(&mut self, config: ConnectionConfig) -> RealtimeResult<()> {
        config.validate()?;
        self.backoff.reconfigure(
            config.reconnect_interval(),
            config.max_reconnect_interval(),
            config.reconnect_backoff_multiplier,
            config.max_reconnect_attempts,
        );
        self.heartbeat
            .set_timing(config.heartbeat_interval(), config.heartbeat_timeout());
        let evicted = self.queue.reconfigure(config.queue_config());
        if !evicted.is_empty() {
            warn!(
                connection = %config.connection_label,
                evicted = evicted.len(),
                "queue shrunk by configuration update"
            );
        }
        self.config = config;
        info!(connection = %self.label(), "configuration updated");
        Ok(())
    }
}

fn spawn_reader(
    actor_ref: ActorRef<ConnectionActor>,
    epoch: u64,
    mut reader: FrameStream,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                }
                next = reader.next() => {
                    match next {
                        Some(Ok(TransportFrame::Close(frame))) => {
                            let _ = actor_ref
                                .tell(TransportClosed { epoch, cause: CloseCause::Frame(frame) })
                                .send()
                                .await;
                            break;
                        }
                        Some(Ok(frame)) => {
                            if actor_ref.tell(Inbound { epoch, frame }).send().await.is_err() {
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            let _ = actor_ref
                                .tell(TransportClosed { epoch, cause: CloseCause::Error(error) })
                                .send()
                                .await;
                            break;
                        }
                        None => {
                            let _ = actor_ref
                                .tell(TransportClosed { epoch, cause: CloseCause::Ended })
                                .send()
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

// Caller-facing messages. Every reply is a `RealtimeResult`.

pub(crate) struct Connect {
    pub(crate) waiter: oneshot::Sender<RealtimeResult<()>>,
}

pub(crate) struct Reconnect {
    pub(crate) waiter: oneshot::Sender<RealtimeResult<()>>,
}

pub(crate) struct Disconnect;

pub(crate) struct Shutdown;

pub(crate) struct SendMessage {
    pub(crate) message: OutboundMessage,
}

pub(crate) struct Subscribe {
    pub(crate) types: Vec<MessageType>,
    pub(crate) filter: SubscriptionFilter,
    pub(crate) callback: MessageCallback,
}

pub(crate) struct Unsubscribe {
    pub(crate) id: SubscriptionId,
}

pub(crate) struct AddStateListener {
    pub(crate) listener: StateListener,
}

pub(crate) struct RemoveStateListener {
    pub(crate) id: u64,
}

pub(crate) struct GetHealth;

pub(crate) struct GetState;

pub(crate) struct GetDebugSnapshot;

pub(crate) struct FlushQueue;

pub(crate) struct UpdateConfig {
    pub(crate) config: ConnectionConfig,
}

// Internal events from IO tasks and timers, stamped with the epoch they belong to.

pub(crate) struct TransportOpened {
    epoch: u64,
    kind: TransportKind,
    link: TransportLink,
}

pub(crate) struct TransportFailed {
    epoch: u64,
    kind: TransportKind,
    error: RealtimeError,
}

pub(crate) struct Inbound {
    epoch: u64,
    frame: TransportFrame,
}

pub(crate) enum CloseCause {
    Frame(Option<CloseFrame>),
    Error(RealtimeError),
    Ended,
}

pub(crate) struct TransportClosed {
    epoch: u64,
    cause: CloseCause,
}

pub(crate) struct HeartbeatTick {
    epoch: u64,
}

pub(crate) struct HeartbeatTimeout {
    epoch: u64,
    ping_id: String,
}

pub(crate) struct ReconnectDue {
    pub(super) epoch: u64,
}

pub(crate) struct QueueRetryDue {
    epoch: u64,
}

impl KameoMessage<Connect> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.closed {
            let _ = msg.waiter.send(Err(RealtimeError::InvalidState(
                "connection manager has been shut down".to_string(),
            )));
            return Ok(());
        }
        self.manual_disconnect = false;
        match self.state {
            ConnectionState::Connected => {
                warn!(connection = %self.label(), "connect() called while already connected");
                let _ = msg.waiter.send(Ok(()));
            }
            ConnectionState::Connecting => {
                warn!(
                    connection = %self.label(),
                    "connect() called while connecting, joining in-flight attempt"
                );
                self.waiters.push(msg.waiter);
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Error
            | ConnectionState::Closed => {
                self.backoff.reset();
                self.fallback_used = false;
                self.waiters.push(msg.waiter);
                self.start_connect();
            }
        }
        Ok(())
    }
}

impl KameoMessage<Reconnect> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: Reconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.closed {
            let _ = msg.waiter.send(Err(RealtimeError::InvalidState(
                "connection manager has been shut down".to_string(),
            )));
            return Ok(());
        }
        info!(connection = %self.label(), state = %self.state, "forced reconnect requested");
        self.manual_disconnect = false;
        self.timers.cancel(&TimerKey::Reconnect);
        self.teardown_transport();
        self.backoff.reset();
        self.fallback_used = false;
        self.waiters.push(msg.waiter);
        self.start_connect();
        Ok(())
    }
}

impl KameoMessage<Disconnect> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manual_disconnect = true;
        self.timers.cancel_all();
        self.teardown_transport();
        self.reject_waiters(&RealtimeError::Disconnected);
        if !self.closed {
            self.set_state(ConnectionState::Disconnected, None);
        }
        info!(connection = %self.label(), "disconnected by caller");
        Ok(())
    }
}

impl KameoMessage<Shutdown> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: Shutdown,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.closed = true;
        self.manual_disconnect = true;
        self.timers.cancel_all();
        self.teardown_transport();
        self.reject_waiters(&RealtimeError::InvalidState(
            "connection manager has been shut down".to_string(),
        ));
        self.registry.clear();
        self.set_state(ConnectionState::Closed, None);
        self.listeners.clear();
        info!(connection = %self.label(), "connection manager shut down");
        Ok(())
    }
}

impl KameoMessage<SendMessage> for ConnectionActor {
    type Reply = RealtimeResult<SendOutcome>;

    async fn handle(
        &mut self,
        msg: SendMessage,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.send_message(msg.message).await
    }
}

impl KameoMessage<Subscribe> for ConnectionActor {
    type Reply = RealtimeResult<SubscriptionId>;

    async fn handle(
        &mut self,
        msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.closed {
            return Err(RealtimeError::InvalidState(
                "connection manager has been shut down".to_string(),
            ));
        }
        Ok(self.registry.subscribe(msg.types, msg.filter, msg.callback))
    }
}

impl KameoMessage<Unsubscribe> for ConnectionActor {
    type Reply = RealtimeResult<bool>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.registry.unsubscribe(msg.id))
    }
}

impl KameoMessage<AddStateListener> for ConnectionActor {
    type Reply = RealtimeResult<u64>;

    async fn handle(
        &mut self,
        msg: AddStateListener,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.next_listener_id = self.next_listener_id.saturating_add(1);
        let id = self.next_listener_id;
        self.listeners.insert(id, msg.listener);
        Ok(id)
    }
}

impl KameoMessage<RemoveStateListener> for ConnectionActor {
    type Reply = RealtimeResult<bool>;

    async fn handle(
        &mut self,
        msg: RemoveStateListener,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.listeners.remove(&msg.id).is_some())
    }
}

impl KameoMessage<GetHealth> for ConnectionActor {
    type Reply = RealtimeResult<ConnectionHealth>;

    async fn handle(
        &mut self,
        _msg: GetHealth,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health_snapshot())
    }
}

impl KameoMessage<GetState> for ConnectionActor {
    type Reply = RealtimeResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state)
    }
}

impl KameoMessage<GetDebugSnapshot> for ConnectionActor {
    type Reply = RealtimeResult<DebugSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetDebugSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.debug_snapshot())
    }
}

impl KameoMessage<FlushQueue> for ConnectionActor {
    type Reply = RealtimeResult<FlushReport>;

    async fn handle(
        &mut self,
        _msg: FlushQueue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.flush_offline_queue().await)
    }
}

impl KameoMessage<UpdateConfig> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: UpdateConfig,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.apply_config(msg.config)
    }
}

impl KameoMessage<TransportOpened> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: TransportOpened,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(
                connection = %self.label(),
                transport = %msg.kind,
                epoch = msg.epoch,
                current = self.epoch,
                "discarding stale transport"
            );
            return Ok(());
        }
        self.on_transport_opened(msg.kind, msg.link).await;
        Ok(())
    }
}

impl KameoMessage<TransportFailed> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: TransportFailed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            return Ok(());
        }
        self.open_task = None;
        warn!(
            connection = %self.label(),
            transport = %msg.kind,
            error = %msg.error,
            "transport open failed"
        );
        self.handle_connection_loss(msg.error, false).await;
        Ok(())
    }
}

impl KameoMessage<Inbound> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, msg: Inbound, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.epoch == self.epoch && self.state == ConnectionState::Connected {
            self.handle_inbound(msg.frame).await;
        }
        Ok(())
    }
}

impl KameoMessage<TransportClosed> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: TransportClosed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch == self.epoch && self.state == ConnectionState::Connected {
            self.handle_transport_closed(msg.cause).await;
        }
        Ok(())
    }
}

impl KameoMessage<HeartbeatTick> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: HeartbeatTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch == self.epoch {
            self.handle_heartbeat_tick().await;
        }
        Ok(())
    }
}

impl KameoMessage<HeartbeatTimeout> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: HeartbeatTimeout,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch == self.epoch && self.state == ConnectionState::Connected {
            self.handle_heartbeat_timeout(msg.ping_id).await;
        }
        Ok(())
    }
}

impl KameoMessage<ReconnectDue> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: ReconnectDue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch == self.epoch {
            self.on_reconnect_due();
        }
        Ok(())
    }
}

impl KameoMessage<QueueRetryDue> for ConnectionActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: QueueRetryDue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.epoch == self.epoch {
            self.timers.forget(&TimerKey::QueueRetry);
            if self.state == ConnectionState::Connected {
                self.flush_offline_queue().await;
            }
        }
        Ok(())
    }
}
