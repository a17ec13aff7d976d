//! Bounded, time-boxed, retryable store of messages that could not be sent immediately.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::{RealtimeError, RealtimeResult};
use super::message::Message;

/// Sizing and retry policy of the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineQueueConfig {
    pub capacity: usize,
    pub retention: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention: Duration::from_secs(300),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Instant,
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    fn is_due(&self, now: Instant) -> bool {
        self.next_retry_at <= now && self.retry_count < self.max_retries
    }
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Ids delivered, in send order.
    pub sent: Vec<String>,
    /// Entries that failed and were rescheduled.
    pub retried: usize,
    /// Entries permanently dropped after exhausting their retries.
    pub dropped: Vec<RealtimeError>,
    /// Entries evicted by the retention sweep before the flush.
    pub expired: Vec<RealtimeError>,
    /// Transport failure that cut the pass short; later entries were not attempted.
    pub interrupted: Option<RealtimeError>,
}

impl FlushReport {
    pub fn failures(&self) -> impl Iterator<Item = &RealtimeError> {
        self.expired.iter().chain(self.dropped.iter())
    }
}

/// FIFO offline queue with oldest-first eviction at capacity.
#[derive(Debug)]
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    entries: VecDeque<QueuedMessage>,
}

impl OfflineQueue {
    pub fn new(config: OfflineQueueConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    pub fn config(&self) -> OfflineQueueConfig {
        self.config
    }

    /// Apply a new policy. Shrinking the capacity evicts the oldest entries.
    pub fn reconfigure(&mut self, config: OfflineQueueConfig) -> Vec<Message> {
        self.config = config;
        let mut evicted = Vec::new();
        while self.entries.len() > self.config.capacity {
            if let Some(entry) = self.entries.pop_front() {
                evicted.push(entry.message);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `message`; when full the oldest entry is evicted and returned.
    ///
    /// The newest message is never the one dropped, except with a zero capacity.
    pub fn enqueue(&mut self, message: Message, now: Instant) -> Option<Message> {
        if self.config.capacity == 0 {
            warn!(message_id = %message.id(), "offline queue has zero capacity, dropping message");
            return Some(message);
        }

        let evicted = if self.entries.len() >= self.config.capacity {
            self.entries.pop_front().map(|entry| entry.message)
        } else {
            None
        };
        if let Some(old) = evicted.as_ref() {
            warn!(
                evicted_id = %old.id(),
                capacity = self.config.capacity,
                "offline queue full, evicted oldest message"
            );
        }

        debug!(message_id = %message.id(), depth = self.entries.len() + 1, "message queued offline");
        self.entries.push_back(QueuedMessage {
            message,
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: now,
            enqueued_at: now,
        });
        evicted
    }

    /// Evict entries older than the retention window regardless of retry state.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<RealtimeError> {
        let retention = self.config.retention;
        let mut expired = Vec::new();
        self.entries.retain(|entry| {
            let age = now.saturating_duration_since(entry.enqueued_at);
            if age > retention {
                warn!(message_id = %entry.message.id(), age_ms = age.as_millis() as u64, "queued message expired");
                expired.push(RealtimeError::QueueExpired {
                    message_id: entry.message.id().to_string(),
                    age,
                });
                false
            } else {
                true
            }
        });
        expired
    }

    /// Earliest pending retry among entries still eligible for delivery.
    pub fn next_due_at(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|entry| entry.retry_count < entry.max_retries)
            .map(|entry| entry.next_retry_at)
            .min()
    }

    /// Attempt delivery of every due entry in FIFO order.
    ///
    /// Success removes the entry. Failure increments `retry_count` and reschedules it at
    /// `retry_base * 2^retry_count`; an entry whose count reaches `max_retries` is dropped.
    /// A transport failure ends the pass and is returned in [`FlushReport::interrupted`].
    pub async fn flush<F, Fut>(&mut self, now: Instant, mut send: F) -> FlushReport
    where
        F: FnMut(Message) -> Fut,
        Fut: Future<Output = RealtimeResult<()>>,
    {
        let mut report = FlushReport {
            expired: self.sweep_expired(now),
            ..FlushReport::default()
        };

        let mut remaining = VecDeque::with_capacity(self.entries.len());
        while let Some(mut entry) = self.entries.pop_front() {
            if !entry.is_due(now) {
                remaining.push_back(entry);
                continue;
            }

            let id = entry.message.id().to_string();
            match send(entry.message.clone()).await {
                Ok(()) => report.sent.push(id),
                Err(err) => {
                    entry.retry_count = entry.retry_count.saturating_add(1);
                    if entry.retry_count >= entry.max_retries {
                        warn!(
                            message_id = %id,
                            attempts = entry.retry_count,
                            error = %err,
                            "queued message permanently failed"
                        );
                        report.dropped.push(RealtimeError::RetriesExhausted {
                            message_id: id,
                            attempts: entry.retry_count,
                        });
                    } else {
                        let delay = retry_delay(self.config.retry_base, entry.retry_count);
                        debug!(
                            message_id = %id,
                            retry = entry.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "queued message send failed, rescheduled"
                        );
                        entry.next_retry_at = now + delay;
                        report.retried += 1;
                        remaining.push_back(entry);
                    }
                    if err.is_transport_failure() {
                        remaining.extend(self.entries.drain(..));
                        report.interrupted = Some(err);
                        break;
                    }
                }
            }
        }
        self.entries = remaining;
        report
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.message.id().to_string())
            .collect()
    }
}

fn retry_delay(base: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{MessageType, OutboundMessage};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn msg(id: &str) -> Message {
        OutboundMessage::new(MessageType::Event, sonic_rs::json!({}))
            .with_id(id)
            .into_message(Utc::now())
    }

    fn queue(capacity: usize) -> OfflineQueue {
        OfflineQueue::new(OfflineQueueConfig {
            capacity,
            ..OfflineQueueConfig::default()
        })
    }

    #[test]
    fn capacity_evicts_oldest_never_newest() {
        let mut q = queue(2);
        let now = Instant::now();
        assert!(q.enqueue(msg("A"), now).is_none());
        assert!(q.enqueue(msg("B"), now).is_none());
        let evicted = q.enqueue(msg("C"), now).expect("A evicted");
        assert_eq!(evicted.id(), "A");
        assert_eq!(q.ids(), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn flush_sends_in_fifo_order_and_empties_queue() {
        let mut q = queue(2);
        let now = Instant::now();
        for id in ["A", "B", "C"] {
            q.enqueue(msg(id), now);
        }

        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let report = q
            .flush(now, |m| {
                sink.lock().unwrap().push(m.id().to_string());
                async { Ok(()) }
            })
            .await;

        assert_eq!(*sent.lock().unwrap(), vec!["B", "C"]);
        assert_eq!(report.sent, vec!["B", "C"]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn failed_sends_back_off_then_drop_after_max_retries() {
        let mut q = OfflineQueue::new(OfflineQueueConfig {
            capacity: 10,
            retention: Duration::from_secs(3600),
            max_retries: 2,
            retry_base: Duration::from_millis(100),
        });
        let t0 = Instant::now();
        q.enqueue(msg("A"), t0);

        let fail = |_m: Message| async { Err(RealtimeError::NotConnected) };

        let first = q.flush(t0, fail).await;
        assert_eq!(first.retried, 1);
        let entry = q.entries.front().expect("still queued");
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.next_retry_at, t0 + Duration::from_millis(200));

        // Not yet due: untouched.
        let early = q.flush(t0 + Duration::from_millis(150), fail).await;
        assert_eq!(early, FlushReport::default());
        assert_eq!(q.len(), 1);

        let second = q.flush(t0 + Duration::from_millis(200), fail).await;
        assert_eq!(second.dropped.len(), 1);
        assert!(matches!(
            second.dropped[0],
            RealtimeError::RetriesExhausted { attempts: 2, .. }
        ));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn mixed_outcomes_keep_failed_entries_in_order() {
        let mut q = queue(10);
        let now = Instant::now();
        for id in ["A", "B", "C"] {
            q.enqueue(msg(id), now);
        }
        let report = q
            .flush(now, |m| {
                let ok = m.id() != "B";
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(RealtimeError::NotConnected)
                    }
                }
            })
            .await;
        assert_eq!(report.sent, vec!["A", "C"]);
        assert_eq!(report.retried, 1);
        assert_eq!(q.ids(), vec!["B"]);
        assert_eq!(q.next_due_at(), Some(now + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn transport_failure_stops_the_pass() {
        let mut q = queue(10);
        let now = Instant::now();
        for id in ["A", "B", "C"] {
            q.enqueue(msg(id), now);
        }
        let attempted = Arc::new(Mutex::new(Vec::new()));
        let log = attempted.clone();
        let report = q
            .flush(now, |m| {
                log.lock().unwrap().push(m.id().to_string());
                let ok = m.id() == "A";
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(RealtimeError::transport("write", "connection reset"))
                    }
                }
            })
            .await;

        assert_eq!(*attempted.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(report.sent, vec!["A"]);
        assert_eq!(report.retried, 1);
        assert!(matches!(
            report.interrupted,
            Some(RealtimeError::TransportError { .. })
        ));
        assert_eq!(q.ids(), vec!["B", "C"]);
        assert_eq!(q.entries[1].retry_count, 0);
    }

    #[test]
    fn retention_sweep_evicts_stale_entries() {
        let mut q = OfflineQueue::new(OfflineQueueConfig {
            capacity: 10,
            retention: Duration::from_secs(60),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        q.enqueue(msg("old"), t0);
        q.enqueue(msg("new"), t0 + Duration::from_secs(50));

        let expired = q.sweep_expired(t0 + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert_eq!(q.ids(), vec!["new"]);
    }

    #[test]
    fn shrinking_capacity_evicts_oldest() {
        let mut q = queue(3);
        let now = Instant::now();
        for id in ["A", "B", "C"] {
            q.enqueue(msg(id), now);
        }
        let evicted = q.reconfigure(OfflineQueueConfig {
            capacity: 1,
            ..q.config()
        });
        assert_eq!(evicted.len(), 2);
        assert_eq!(q.ids(), vec!["C"]);
    }
}
