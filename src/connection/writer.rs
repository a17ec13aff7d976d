use futures_util::SinkExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::trace;

use crate::core::{RealtimeError, RealtimeResult, TransportFrame};
use crate::transport::FrameSink;

/// Owns the outbound half of the transport and serializes writes.
pub(crate) struct WriterActor {
    sink: FrameSink,
    shutdown_rx: watch::Receiver<bool>,
}

impl WriterActor {
    pub(crate) fn new(sink: FrameSink, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { sink, shutdown_rx }
    }
}

impl Actor for WriterActor {
    type Args = Self;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "WriterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "WriterActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

pub(crate) struct WriteFrame {
    pub(crate) frame: TransportFrame,
}

impl KameoMessage<WriteFrame> for WriterActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        msg: WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if *self.shutdown_rx.borrow() {
            return Err(RealtimeError::InvalidState("writer stopped".to_string()));
        }
        trace!(target: "realtime-writer", len = msg.frame.len(), "writing frame");
        self.sink.send(msg.frame).await
    }
}

/// Best-effort close of the outbound half during teardown.
pub(crate) struct CloseSink;

impl KameoMessage<CloseSink> for WriterActor {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: CloseSink,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let _ = self.sink.close().await;
        Ok(())
    }
}
