use std::collections::HashMap;
use std::sync::Arc;

use kameo::prelude::{Actor, ActorRef};
use tokio::sync::oneshot;
use tracing::debug;

use super::actor::{
    AddStateListener, Connect, ConnectionActor, ConnectionActorArgs, Disconnect, FlushQueue,
    GetDebugSnapshot, GetHealth, GetState, Reconnect, RemoveStateListener, SendMessage,
    Shutdown, Subscribe, Unsubscribe, UpdateConfig, map_send_error,
};
use super::{DebugSnapshot, SendOutcome};
use crate::core::{
    ConnectionConfig, ConnectionHealth, ConnectionState, FlushReport, Message, MessageType,
    OutboundMessage, RealtimeError, RealtimeResult, SubscriptionFilter, SubscriptionId,
    TransportKind,
};
use crate::transport::{EventSourceTransport, Transport, WebSocketTransport};

/// Caller-facing handle to one managed connection.
///
/// Cheap to clone; every clone talks to the same connection actor, which serializes all
/// operations, inbound frames and timer ticks.
#[derive(Clone)]
pub struct ConnectionManager {
    actor: ActorRef<ConnectionActor>,
}

/// Configures transports before spawning a [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    config: ConnectionConfig,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl ConnectionManagerBuilder {
    /// Use `transport` for its [`TransportKind`], replacing the default implementation.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Spawn the connection actor. Must be called within a Tokio runtime.
    pub fn build(self) -> RealtimeResult<ConnectionManager> {
        let Self {
            config,
            mut transports,
        } = self;
        config.validate()?;

        if !transports.contains_key(&TransportKind::WebSocket) {
            transports.insert(TransportKind::WebSocket, Arc::new(WebSocketTransport::new()));
        }
        if !transports.contains_key(&TransportKind::EventSource) {
            transports.insert(
                TransportKind::EventSource,
                Arc::new(EventSourceTransport::new()?),
            );
        }

        debug!(connection = %config.connection_label, "spawning connection actor");
        let actor = ConnectionActor::spawn(ConnectionActorArgs { config, transports });
        Ok(ConnectionManager { actor })
    }
}

impl ConnectionManager {
    /// Spawn with the default WebSocket and SSE transports.
    pub fn spawn(config: ConnectionConfig) -> RealtimeResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ConnectionConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            transports: HashMap::new(),
        }
    }

    /// Resolve once the connection is established, or reject with the failure that ended
    /// the attempt. Concurrent callers share the in-flight attempt.
    pub async fn connect(&self) -> RealtimeResult<()> {
        let (waiter, done) = oneshot::channel();
        self.actor
            .ask(Connect { waiter })
            .await
            .map_err(map_send_error)?;
        await_waiter(done).await
    }

    /// Close the active transport and cancel every timer. No automatic reconnect follows.
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        self.actor.ask(Disconnect).await.map_err(map_send_error)
    }

    /// Tear down and immediately open a fresh connection with a reset attempt counter.
    pub async fn reconnect(&self) -> RealtimeResult<()> {
        let (waiter, done) = oneshot::channel();
        self.actor
            .ask(Reconnect { waiter })
            .await
            .map_err(map_send_error)?;
        await_waiter(done).await
    }

    /// Send now if connected, otherwise hold the message in the offline queue.
    pub async fn send_message(&self, message: OutboundMessage) -> RealtimeResult<SendOutcome> {
        self.actor
            .ask(SendMessage { message })
            .await
            .map_err(map_send_error)
    }

    /// Register `callback` for inbound messages of `types` that pass `filter`.
    ///
    /// The callback runs on the connection actor; long work should be handed off.
    pub async fn subscribe<F>(
        &self,
        types: impl IntoIterator<Item = MessageType>,
        filter: SubscriptionFilter,
        callback: F,
    ) -> RealtimeResult<SubscriptionId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.actor
            .ask(Subscribe {
                types: types.into_iter().collect(),
                filter,
                callback: Arc::new(callback),
            })
            .await
            .map_err(map_send_error)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> RealtimeResult<bool> {
        self.actor
            .ask(Unsubscribe { id })
            .await
            .map_err(map_send_error)
    }

    /// Observe state transitions. Listeners fire only when the state actually changes.
    pub async fn on_connection_state_change<F>(&self, listener: F) -> RealtimeResult<StateListenerHandle>
    where
        F: Fn(ConnectionState, Option<&RealtimeError>) + Send + Sync + 'static,
    {
        let id = self
            .actor
            .ask(AddStateListener {
                listener: Arc::new(listener),
            })
            .await
            .map_err(map_send_error)?;
        Ok(StateListenerHandle {
            id,
            actor: self.actor.clone(),
        })
    }

    pub async fn get_connection_health(&self) -> RealtimeResult<ConnectionHealth> {
        self.actor.ask(GetHealth).await.map_err(map_send_error)
    }

    pub async fn state(&self) -> RealtimeResult<ConnectionState> {
        self.actor.ask(GetState).await.map_err(map_send_error)
    }

    /// Attempt delivery of due offline-queue entries now.
    pub async fn flush_queue(&self) -> RealtimeResult<FlushReport> {
        self.actor.ask(FlushQueue).await.map_err(map_send_error)
    }

    /// Apply new timing, queue and recovery settings. URLs take effect on the next open.
    pub async fn update_config(&self, config: ConnectionConfig) -> RealtimeResult<()> {
        self.actor
            .ask(UpdateConfig { config })
            .await
            .map_err(map_send_error)
    }

    pub async fn debug_snapshot(&self) -> RealtimeResult<DebugSnapshot> {
        self.actor.ask(GetDebugSnapshot).await.map_err(map_send_error)
    }

    /// Disconnect, drop all subscriptions and listeners, and stop the actor. Terminal.
    pub async fn shutdown(&self) -> RealtimeResult<()> {
        self.actor.ask(Shutdown).await.map_err(map_send_error)?;
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
        Ok(())
    }
}

async fn await_waiter(done: oneshot::Receiver<RealtimeResult<()>>) -> RealtimeResult<()> {
    done.await.map_err(|_| {
        RealtimeError::ActorError("connection actor dropped the pending request".to_string())
    })?
}

/// Returned by [`ConnectionManager::on_connection_state_change`].
pub struct StateListenerHandle {
    id: u64,
    actor: ActorRef<ConnectionActor>,
}

impl StateListenerHandle {
    /// Stop receiving transitions. Returns whether the listener was still registered.
    pub async fn remove(self) -> RealtimeResult<bool> {
        self.actor
            .ask(RemoveStateListener { id: self.id })
            .await
            .map_err(map_send_error)
    }
}
