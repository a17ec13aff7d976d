use std::time::Duration;

/// Exponential reconnect backoff with an attempt cap.
///
/// `delay = min(base * multiplier^attempts, max)`. No jitter: the sequence of delays across
/// consecutive failures is monotonically non-decreasing.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64, max_attempts: u32) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.5
        };
        Self {
            base,
            max: max.max(base),
            multiplier,
            max_attempts,
            attempts: 0,
        }
    }

    /// Swap the policy while keeping the attempt counter.
    pub fn reconfigure(&mut self, base: Duration, max: Duration, multiplier: f64, max_attempts: u32) {
        let attempts = self.attempts;
        *self = Self::new(base, max, multiplier, max_attempts);
        self.attempts = attempts;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before the next attempt, or `None` once the attempt cap is reached.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let exp = self.multiplier.powi(self.attempts.min(i32::MAX as u32) as i32);
        let secs = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());
        Some(Duration::from_secs_f64(secs))
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 1.5, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_monotonically_and_cap() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0, 10);
        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay);
            backoff.record_attempt();
        }

        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(1000));
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn reset_returns_to_base_interval() {
        let mut backoff = ReconnectBackoff::default();
        backoff.record_attempt();
        backoff.record_attempt();
        assert!(backoff.next_delay().unwrap() > Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn invalid_multiplier_falls_back() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(5), f64::NAN, 3);
        assert_eq!(backoff.multiplier, 1.5);
    }

    #[test]
    fn reconfigure_keeps_attempts() {
        let mut backoff = ReconnectBackoff::default();
        backoff.record_attempt();
        backoff.reconfigure(Duration::from_millis(10), Duration::from_millis(100), 2.0, 1);
        assert_eq!(backoff.attempts(), 1);
        assert_eq!(backoff.next_delay(), None);
    }
}
