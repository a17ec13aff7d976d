use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{RealtimeError, RealtimeResult};
use super::queue::OfflineQueueConfig;
use super::recovery::ErrorRecoveryConfig;
use super::state::TransportKind;

/// Connection manager configuration.
///
/// Every field has a default, so a JSON document only needs the keys it overrides:
///
/// ```json
/// { "websocketUrl": "wss://example.test/ws", "authToken": "t0k3n", "heartbeatIntervalMs": 15000 }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub websocket_url: Option<String>,
    pub event_source_url: Option<String>,
    /// Endpoint for outbound messages while on the event-source transport. Without it the
    /// event-source transport is receive-only.
    pub event_source_post_url: Option<String>,
    pub preferred_type: TransportKind,
    pub fallback_to_secondary: bool,
    pub auth_token: Option<String>,

    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub reconnect_backoff_multiplier: f64,

    pub enable_heartbeat: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,

    pub enable_offline_queue: bool,
    pub max_queue_size: usize,
    pub queue_retention_ms: u64,
    pub queue_max_retries: u32,
    pub queue_retry_base_ms: u64,

    pub connection_timeout_ms: u64,

    /// Log every inbound/outbound frame at trace level.
    pub verbose_logging: bool,
    /// Attached to every log line as `connection = ...`.
    pub connection_label: String,

    #[serde(skip)]
    pub error_recovery: ErrorRecoveryConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            websocket_url: None,
            event_source_url: None,
            event_source_post_url: None,
            preferred_type: TransportKind::WebSocket,
            fallback_to_secondary: true,
            auth_token: None,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            reconnect_backoff_multiplier: 1.5,
            enable_heartbeat: true,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            enable_offline_queue: true,
            max_queue_size: 1_000,
            queue_retention_ms: 300_000,
            queue_max_retries: 3,
            queue_retry_base_ms: 1_000,
            connection_timeout_ms: 10_000,
            verbose_logging: false,
            connection_label: "realtime".to_string(),
            error_recovery: ErrorRecoveryConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            websocket_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn event_source(url: impl Into<String>) -> Self {
        Self {
            event_source_url: Some(url.into()),
            preferred_type: TransportKind::EventSource,
            ..Self::default()
        }
    }

    /// Parse a JSON document (camelCase keys) and validate it.
    pub fn from_json_str(raw: &str) -> RealtimeResult<Self> {
        let config: Self = sonic_rs::from_str(raw)
            .map_err(|err| RealtimeError::InvalidConfig(format!("malformed config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RealtimeResult<()> {
        fn invalid(msg: impl Into<String>) -> RealtimeResult<()> {
            Err(RealtimeError::InvalidConfig(msg.into()))
        }

        for (name, url) in [
            ("websocketUrl", &self.websocket_url),
            ("eventSourceUrl", &self.event_source_url),
            ("eventSourcePostUrl", &self.event_source_post_url),
        ] {
            if let Some(url) = url
                && url.trim().is_empty()
            {
                return invalid(format!("{name} must not be empty when set"));
            }
        }
        if !self.reconnect_backoff_multiplier.is_finite() || self.reconnect_backoff_multiplier < 1.0
        {
            return invalid("reconnectBackoffMultiplier must be a finite number >= 1.0");
        }
        if self.max_reconnect_interval_ms < self.reconnect_interval_ms {
            return invalid("maxReconnectIntervalMs must be >= reconnectIntervalMs");
        }
        if self.enable_heartbeat && (self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms == 0)
        {
            return invalid("heartbeat interval and timeout must be non-zero when enabled");
        }
        if self.connection_timeout_ms == 0 {
            return invalid("connectionTimeoutMs must be non-zero");
        }
        if self.enable_offline_queue && self.max_queue_size == 0 {
            return invalid("maxQueueSize must be non-zero when the offline queue is enabled");
        }
        Ok(())
    }

    /// URL configured for `kind`, if any.
    pub fn url_for(&self, kind: TransportKind) -> Option<&str> {
        match kind {
            TransportKind::WebSocket => self.websocket_url.as_deref(),
            TransportKind::EventSource => self.event_source_url.as_deref(),
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn queue_config(&self) -> OfflineQueueConfig {
        OfflineQueueConfig {
            capacity: self.max_queue_size,
            retention: Duration::from_millis(self.queue_retention_ms),
            max_retries: self.queue_max_retries,
            retry_base: Duration::from_millis(self.queue_retry_base_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(1));
        assert_eq!(config.max_reconnect_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue_config(), OfflineQueueConfig::default());
        assert!(config.fallback_to_secondary);
        assert!(config.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_overrides_only_named_keys() {
        let config = ConnectionConfig::from_json_str(
            r#"{"websocketUrl":"ws://localhost:9000/ws","preferredType":"eventsource","heartbeatIntervalMs":500,"connectionLabel":"jobs"}"#,
        )
        .expect("valid config");
        assert_eq!(config.url_for(TransportKind::WebSocket), Some("ws://localhost:9000/ws"));
        assert_eq!(config.url_for(TransportKind::EventSource), None);
        assert_eq!(config.preferred_type, TransportKind::EventSource);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.connection_label, "jobs");
        assert_eq!(config.max_queue_size, 1_000);
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        let bad_multiplier = ConnectionConfig {
            reconnect_backoff_multiplier: 0.5,
            ..ConnectionConfig::default()
        };
        assert!(matches!(bad_multiplier.validate(), Err(RealtimeError::InvalidConfig(_))));

        let inverted = ConnectionConfig {
            reconnect_interval_ms: 5_000,
            max_reconnect_interval_ms: 1_000,
            ..ConnectionConfig::default()
        };
        assert!(inverted.validate().is_err());

        let empty_url = ConnectionConfig::websocket("  ");
        assert!(empty_url.validate().is_err());

        assert!(ConnectionConfig::from_json_str("{not json").is_err());
    }
}
