use std::collections::HashMap;
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Message as KameoMessage};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Identity of a tracked timer. Arming a key that is already armed replaces (and aborts)
/// the previous task, so no timer is ever duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum TimerKey {
    Heartbeat,
    PingTimeout(String),
    Reconnect,
    QueueRetry,
}

impl TimerKey {
    pub(crate) fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            TimerKey::Heartbeat | TimerKey::PingTimeout(_) | TimerKey::QueueRetry
        )
    }
}

/// Every time-driven wake-up of the connection actor is a task registered here.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    timers: HashMap<TimerKey, JoinHandle<()>>,
}

impl TimerSet {
    pub(crate) fn arm(&mut self, key: TimerKey, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.timers.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop bookkeeping for a timer whose message is being handled right now.
    pub(crate) fn forget(&mut self, key: &TimerKey) {
        self.timers.remove(key);
    }

    pub(crate) fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKey) -> bool) {
        self.timers.retain(|key, handle| {
            if predicate(key) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self, key: &TimerKey) -> bool {
        self.timers.get(key).is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn active(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

/// Deliver `msg` to `actor_ref` once after `delay`.
pub(crate) fn after<A, M>(actor_ref: &ActorRef<A>, delay: Duration, msg: M) -> JoinHandle<()>
where
    A: Actor + KameoMessage<M>,
    M: Send + 'static,
{
    let actor_ref = actor_ref.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = actor_ref.tell(msg).send().await;
    })
}

/// Deliver `make()` to `actor_ref` every `period`, first tick one period from now.
pub(crate) fn every<A, M, F>(actor_ref: &ActorRef<A>, period: Duration, make: F) -> JoinHandle<()>
where
    A: Actor + KameoMessage<M>,
    M: Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    let actor_ref = actor_ref.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if actor_ref.tell(make()).send().await.is_err() {
                break;
            }
        }
    })
}
