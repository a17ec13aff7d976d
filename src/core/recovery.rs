//! Error taxonomy and the static category → recovery-strategy table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Auth,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Schedule a backoff reconnect unless a manual disconnect is in effect.
    Reconnect,
    /// Open the alternate transport type, if configured.
    FallbackConnection,
    /// Marker: sends queue naturally while the connection is down.
    QueueOffline,
    /// Record the error for external intervention; no recovery attempt.
    NotifyOnly,
    /// Log at error severity for external alerting; terminal for this error.
    Escalate,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Reconnect => "reconnect",
            RecoveryStrategy::FallbackConnection => "fallback_connection",
            RecoveryStrategy::QueueOffline => "queue_offline",
            RecoveryStrategy::NotifyOnly => "notify_only",
            RecoveryStrategy::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// Category → ordered strategy list. Read-only once the connection is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorRecoveryConfig {
    strategies: BTreeMap<ErrorCategory, Vec<RecoveryStrategy>>,
}

impl ErrorRecoveryConfig {
    pub fn new(strategies: BTreeMap<ErrorCategory, Vec<RecoveryStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn with(mut self, category: ErrorCategory, strategies: Vec<RecoveryStrategy>) -> Self {
        self.strategies.insert(category, strategies);
        self
    }

    /// Strategies for `category`; an unmapped category falls back to `notify_only`.
    pub fn strategies_for(&self, category: ErrorCategory) -> &[RecoveryStrategy] {
        const FALLBACK: &[RecoveryStrategy] = &[RecoveryStrategy::NotifyOnly];
        self.strategies
            .get(&category)
            .map(Vec::as_slice)
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK)
    }

    pub fn resolve(&self, error: &RealtimeError) -> (ErrorCategory, &[RecoveryStrategy]) {
        let category = classify_error(error);
        (category, self.strategies_for(category))
    }
}

impl Default for ErrorRecoveryConfig {
    fn default() -> Self {
        use RecoveryStrategy::*;
        let mut strategies = BTreeMap::new();
        strategies.insert(ErrorCategory::Network, vec![Reconnect, QueueOffline]);
        strategies.insert(ErrorCategory::Timeout, vec![Reconnect, QueueOffline]);
        strategies.insert(ErrorCategory::Auth, vec![NotifyOnly]);
        strategies.insert(ErrorCategory::Server, vec![FallbackConnection, Reconnect]);
        strategies.insert(ErrorCategory::Unknown, vec![Reconnect, Escalate]);
        Self { strategies }
    }
}

/// Classify an error: typed reasons first, then the message text.
pub fn classify_error(error: &RealtimeError) -> ErrorCategory {
    match error {
        RealtimeError::Timeout { .. } | RealtimeError::HeartbeatTimeout { .. } => {
            ErrorCategory::Timeout
        }
        RealtimeError::AuthenticationFailed { .. } => ErrorCategory::Auth,
        RealtimeError::ServerError { .. } => ErrorCategory::Server,
        RealtimeError::RemoteClosed {
            code: Some(code), ..
        } => match code {
            1008 | 4001 | 4003 => ErrorCategory::Auth,
            1011 | 1013 => ErrorCategory::Server,
            _ => ErrorCategory::Network,
        },
        RealtimeError::RemoteClosed { code: None, .. } => ErrorCategory::Network,
        other => classify_message(&other.to_string()),
    }
}

/// Pure text classification, checked in order auth → timeout → server → network.
pub fn classify_message(message: &str) -> ErrorCategory {
    const AUTH: &[&str] = &["401", "403", "unauthorized", "forbidden", "authentication"];
    const TIMEOUT: &[&str] = &["timeout", "timed out"];
    const SERVER: &[&str] = &["500", "502", "503", "504", "server error", "internal error"];
    const NETWORK: &[&str] = &[
        "network",
        "connection",
        "connect",
        "refused",
        "reset",
        "closed",
        "unreachable",
        "dns",
        "broken pipe",
        "eof",
    ];

    let text = message.to_ascii_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has_any(AUTH) {
        ErrorCategory::Auth
    } else if has_any(TIMEOUT) {
        ErrorCategory::Timeout
    } else if has_any(SERVER) {
        ErrorCategory::Server
    } else if has_any(NETWORK) {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unauthorized_resolves_to_notify_only() {
        let config = ErrorRecoveryConfig::default();
        let err = RealtimeError::ConnectionFailed("HTTP error: 401 Unauthorized".to_string());
        let (category, strategies) = config.resolve(&err);
        assert_eq!(category, ErrorCategory::Auth);
        assert_eq!(strategies, &[RecoveryStrategy::NotifyOnly]);
    }

    #[test]
    fn typed_reasons_win_over_text() {
        assert_eq!(
            classify_error(&RealtimeError::HeartbeatTimeout {
                ping_id: "1".into(),
                timeout: Duration::from_secs(1)
            }),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_error(&RealtimeError::ServerError {
                code: Some(1),
                message: "unauthorized".into()
            }),
            ErrorCategory::Server
        );
        assert_eq!(
            classify_error(&RealtimeError::RemoteClosed {
                code: Some(4001),
                reason: "".into()
            }),
            ErrorCategory::Auth
        );
        assert_eq!(
            classify_error(&RealtimeError::RemoteClosed {
                code: Some(1011),
                reason: "".into()
            }),
            ErrorCategory::Server
        );
        assert_eq!(
            classify_error(&RealtimeError::RemoteClosed {
                code: Some(1006),
                reason: "".into()
            }),
            ErrorCategory::Network
        );
    }

    #[test]
    fn text_classification_order() {
        assert_eq!(classify_message("connection timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_message("HTTP 503 Service Unavailable"), ErrorCategory::Server);
        assert_eq!(classify_message("IO error: Connection refused"), ErrorCategory::Network);
        assert_eq!(classify_message("403 Forbidden: connection rejected"), ErrorCategory::Auth);
        assert_eq!(classify_message("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn unmapped_category_falls_back_to_notify_only() {
        let config = ErrorRecoveryConfig::new(BTreeMap::new());
        assert_eq!(
            config.strategies_for(ErrorCategory::Network),
            &[RecoveryStrategy::NotifyOnly]
        );
        let overridden = config.with(ErrorCategory::Network, vec![RecoveryStrategy::Escalate]);
        assert_eq!(
            overridden.strategies_for(ErrorCategory::Network),
            &[RecoveryStrategy::Escalate]
        );
    }

    #[test]
    fn default_table_matches_documented_policy() {
        let config = ErrorRecoveryConfig::default();
        assert_eq!(
            config.strategies_for(ErrorCategory::Server),
            &[RecoveryStrategy::FallbackConnection, RecoveryStrategy::Reconnect]
        );
        assert_eq!(
            config.strategies_for(ErrorCategory::Unknown),
            &[RecoveryStrategy::Reconnect, RecoveryStrategy::Escalate]
        );
    }
}
