//! Subscription registry: typed, filtered fan-out of inbound messages.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::message::{Message, MessageType};

/// Subscriber callback. Runs on the connection actor, so it should hand work off quickly.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Custom predicate evaluated after the type and correlation-key filters.
pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Optional filters applied on top of the type match.
#[derive(Clone, Default)]
pub struct SubscriptionFilter {
    pub node_id: Option<String>,
    pub workflow_id: Option<String>,
    pub predicate: Option<MessagePredicate>,
}

impl SubscriptionFilter {
    pub fn node(node_id: impl Into<String>) -> Self {
        Self::default().with_node_id(node_id)
    }

    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self::default().with_workflow_id(workflow_id)
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFilter")
            .field("node_id", &self.node_id)
            .field("workflow_id", &self.workflow_id)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

pub struct Subscription {
    id: SubscriptionId,
    types: Vec<MessageType>,
    filter: SubscriptionFilter,
    callback: MessageCallback,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn types(&self) -> &[MessageType] {
        &self.types
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn matches(&self, message: &Message) -> bool {
        if !self.is_active || !self.types.contains(&message.kind()) {
            return false;
        }
        if let Some(node_id) = self.filter.node_id.as_deref()
            && message.node_id() != Some(node_id)
        {
            return false;
        }
        if let Some(workflow_id) = self.filter.workflow_id.as_deref()
            && message.workflow_id() != Some(workflow_id)
        {
            return false;
        }
        match self.filter.predicate.as_ref() {
            Some(predicate) => predicate(message),
            None => true,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("types", &self.types)
            .field("filter", &self.filter)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Outcome of a single dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Owns every subscription; callers only go through `subscribe`/`unsubscribe`/`dispatch`.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `types`. Duplicate types are collapsed, first occurrence wins.
    pub fn subscribe(
        &mut self,
        types: impl IntoIterator<Item = MessageType>,
        filter: SubscriptionFilter,
        callback: MessageCallback,
    ) -> SubscriptionId {
        let mut ordered = Vec::new();
        for kind in types {
            if !ordered.contains(&kind) {
                ordered.push(kind);
            }
        }

        self.next_id = self.next_id.saturating_add(1);
        let id = SubscriptionId(self.next_id);
        debug!(subscription = %id, types = ?ordered, filter = ?filter, "subscription added");
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                types: ordered,
                filter,
                callback,
                is_active: true,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Deactivate and remove `id`. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some(mut sub) => {
                sub.is_active = false;
                debug!(subscription = %id, "subscription removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        for sub in self.subscriptions.values_mut() {
            sub.is_active = false;
        }
        self.subscriptions.clear();
    }

    /// Deliver `message` to every matching active subscription, in subscription order.
    ///
    /// A panicking callback is contained and logged; remaining subscribers still receive
    /// the message.
    pub fn dispatch(&self, message: &Message) -> DispatchReport {
        let mut report = DispatchReport::default();
        for sub in self.subscriptions.values() {
            if !sub.matches(message) {
                continue;
            }
            let callback = &sub.callback;
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        subscription = %sub.id,
                        message_id = %message.id(),
                        message_type = %message.kind(),
                        panic = %panic_message(panic.as_ref()),
                        "subscriber callback failed"
                    );
                }
            }
        }
        report
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::OutboundMessage;
    use std::sync::Mutex;

    fn msg(kind: MessageType, node: Option<&str>, workflow: Option<&str>) -> Message {
        let mut out = OutboundMessage::new(kind, sonic_rs::json!({}));
        out.node_id = node.map(str::to_string);
        out.workflow_id = workflow.map(str::to_string);
        out.into_message(Utc::now())
    }

    fn recorder() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: MessageCallback = Arc::new(move |m: &Message| {
            sink.lock().unwrap().push(m.id().to_string());
        });
        (cb, seen)
    }

    #[test]
    fn node_filter_selects_only_matching_messages() {
        let mut registry = SubscriptionRegistry::new();
        let (cb, seen) = recorder();
        registry.subscribe([MessageType::StatusUpdate], SubscriptionFilter::node("n1"), cb);

        let n1 = msg(MessageType::StatusUpdate, Some("n1"), None);
        let n2 = msg(MessageType::StatusUpdate, Some("n2"), None);
        assert_eq!(registry.dispatch(&n1).delivered, 1);
        assert_eq!(registry.dispatch(&n2).delivered, 0);

        assert_eq!(*seen.lock().unwrap(), vec![n1.id().to_string()]);
    }

    #[test]
    fn type_workflow_and_predicate_filters_compose() {
        let mut registry = SubscriptionRegistry::new();
        let (cb, seen) = recorder();
        registry.subscribe(
            [MessageType::ProgressUpdate, MessageType::Result, MessageType::Result],
            SubscriptionFilter::workflow("w1").with_predicate(|m| m.version() == Some(1)),
            cb,
        );

        let hit = msg(MessageType::Result, None, Some("w1"));
        let wrong_type = msg(MessageType::Log, None, Some("w1"));
        let wrong_workflow = msg(MessageType::Result, None, Some("w2"));
        let stale = {
            let out = OutboundMessage::new(MessageType::ProgressUpdate, sonic_rs::json!({}))
                .with_workflow_id("w1")
                .with_version(2);
            out.into_message(Utc::now())
        };

        for m in [&hit, &wrong_type, &wrong_workflow, &stale] {
            registry.dispatch(m);
        }
        assert_eq!(*seen.lock().unwrap(), vec![hit.id().to_string()]);
    }

    #[test]
    fn unsubscribed_callback_is_never_invoked_again() {
        let mut registry = SubscriptionRegistry::new();
        let (cb, seen) = recorder();
        let id = registry.subscribe([MessageType::Event], SubscriptionFilter::default(), cb);

        registry.dispatch(&msg(MessageType::Event, None, None));
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        for _ in 0..3 {
            registry.dispatch(&msg(MessageType::Event, None, None));
        }

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(
            [MessageType::Log],
            SubscriptionFilter::default(),
            Arc::new(|_: &Message| panic!("subscriber blew up")),
        );
        let (cb, seen) = recorder();
        registry.subscribe([MessageType::Log], SubscriptionFilter::default(), cb);

        let report = registry.dispatch(&msg(MessageType::Log, None, None));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn subscribe_dedups_types_preserving_order() {
        let mut registry = SubscriptionRegistry::new();
        let (cb, _) = recorder();
        let id = registry.subscribe(
            [MessageType::Log, MessageType::Error, MessageType::Log],
            SubscriptionFilter::default(),
            cb,
        );
        let sub = registry.subscriptions.get(&id).expect("registered");
        assert_eq!(sub.types(), &[MessageType::Log, MessageType::Error]);
        assert!(sub.is_active());
    }
}
