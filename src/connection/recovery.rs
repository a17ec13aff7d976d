//! Recovery pipeline: classify a connection failure, then walk the configured strategies
//! in order until one applies.

use tracing::{debug, error, info, warn};

use super::actor::{ConnectionActor, ReconnectDue};
use super::timers::{self, TimerKey};
use crate::core::{ConnectionState, RealtimeError, RecoveryStrategy};

/// Why a strategy did not apply; the pipeline moves on to the next one.
#[derive(Debug)]
struct Skipped(&'static str);

impl ConnectionActor {
    /// Returns `true` once a strategy has moved the connection to its next state.
    pub(super) fn run_recovery(&mut self, err: &RealtimeError) -> bool {
        let (category, strategies) = self.config.error_recovery.resolve(err);
        let strategies = strategies.to_vec();
        self.health.record_error(category, &err.to_string());
        debug!(
            connection = %self.label(),
            category = %category,
            strategies = ?strategies,
            "recovering from connection error"
        );

        for strategy in strategies {
            match self.apply_strategy(strategy, err) {
                Ok(moved) => {
                    debug!(
                        connection = %self.label(),
                        strategy = %strategy,
                        moved,
                        "recovery strategy applied"
                    );
                    return moved;
                }
                Err(Skipped(reason)) => {
                    debug!(
                        connection = %self.label(),
                        strategy = %strategy,
                        reason,
                        "recovery strategy skipped"
                    );
                }
            }
        }
        warn!(connection = %self.label(), category = %category, "no recovery strategy applied");
        false
    }

    fn apply_strategy(&mut self, strategy: RecoveryStrategy, err: &RealtimeError) -> Result<bool, Skipped> {
        match strategy {
            RecoveryStrategy::Reconnect => self.schedule_reconnect(),
            RecoveryStrategy::FallbackConnection => self.open_fallback(),
            RecoveryStrategy::QueueOffline => {
                if self.config.enable_offline_queue {
                    Ok(false)
                } else {
                    Err(Skipped("offline queue disabled"))
                }
            }
            RecoveryStrategy::NotifyOnly => {
                self.set_state(ConnectionState::Error, Some(err));
                Ok(true)
            }
            RecoveryStrategy::Escalate => {
                error!(
                    connection = %self.label(),
                    error = %err,
                    "unrecoverable connection error"
                );
                self.set_state(ConnectionState::Error, Some(err));
                Ok(true)
            }
        }
    }

    /// Arm the single reconnect timer. Exhaustion is terminal and counts as applied.
    fn schedule_reconnect(&mut self) -> Result<bool, Skipped> {
        if self.manual_disconnect {
            return Err(Skipped("manual disconnect in effect"));
        }
        if !self.config.auto_reconnect {
            return Err(Skipped("auto reconnect disabled"));
        }
        if self.timers.is_armed(&TimerKey::Reconnect) {
            return Ok(true);
        }

        let Some(delay) = self.backoff.next_delay() else {
            let exhausted = RealtimeError::ReconnectExhausted {
                attempts: self.backoff.attempts(),
            };
            error!(
                connection = %self.label(),
                attempts = self.backoff.attempts(),
                "reconnect attempts exhausted"
            );
            self.note_error(&exhausted);
            self.set_state(ConnectionState::Error, Some(&exhausted));
            return Ok(true);
        };

        self.set_state(ConnectionState::Reconnecting, None);
        warn!(
            connection = %self.label(),
            attempt = self.backoff.attempts() + 1,
            max_attempts = self.backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let handle = timers::after(&self.actor_ref, delay, ReconnectDue { epoch: self.epoch });
        self.timers.arm(TimerKey::Reconnect, handle);
        Ok(true)
    }

    /// Try the other transport kind once per connected session.
    fn open_fallback(&mut self) -> Result<bool, Skipped> {
        if self.manual_disconnect {
            return Err(Skipped("manual disconnect in effect"));
        }
        if !self.config.fallback_to_secondary {
            return Err(Skipped("fallback disabled"));
        }
        if self.fallback_used {
            return Err(Skipped("fallback already used"));
        }
        let failed = self.last_transport.unwrap_or(self.config.preferred_type);
        let target = failed.other();
        let Some((transport, url)) = self.transport_for(target) else {
            return Err(Skipped("alternate transport not configured"));
        };

        self.fallback_used = true;
        info!(
            connection = %self.label(),
            from = %failed,
            to = %target,
            "falling back to alternate transport"
        );
        self.begin_open(target, transport, url);
        Ok(true)
    }

    pub(super) fn on_reconnect_due(&mut self) {
        self.timers.forget(&TimerKey::Reconnect);
        if self.manual_disconnect || self.state != ConnectionState::Reconnecting {
            return;
        }
        let attempt = self.backoff.record_attempt();
        debug!(connection = %self.label(), attempt, "reconnect timer fired");
        self.start_connect();
    }
}
