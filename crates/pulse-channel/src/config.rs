//! Channel connection configuration.

use std::time::Duration;

use url::Url;

/// Configuration for a single channel connection.
///
/// Reconnection uses a fixed interval: every automatic retry waits exactly
/// `reconnect_interval`, up to `max_reconnect_attempts` retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// WebSocket endpoint URL. Opaque credentials travel in its query string.
    pub url: String,

    // Reconnection settings
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Cap on automatic retries before giving up.
    pub max_reconnect_attempts: u32,

    // Heartbeat settings
    /// Interval between `{"type":"ping"}` keep-alive frames.
    pub heartbeat_interval: Duration,
    /// Maximum silence on the socket before it is considered dead
    /// (None = never).
    pub liveness_timeout: Option<Duration>,

    // Connection
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Maximum inbound frame size in bytes (0 = unlimited).
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval: Duration::from_millis(5_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_millis(30_000),
            liveness_timeout: None,
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl ChannelConfig {
    /// Create a new configuration with the given URL and default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Timings for conversational channels (chat rooms): retry sooner,
    /// retry longer, heartbeat slightly faster than the default.
    pub fn conversational(url: impl Into<String>) -> Self {
        Self::new(url)
            .reconnect_interval(Duration::from_millis(3_000))
            .max_reconnect_attempts(15)
            .heartbeat_interval(Duration::from_millis(25_000))
    }

    /// Timings for the bulk infrastructure channel.
    pub fn infrastructure(url: impl Into<String>) -> Self {
        Self::new(url)
    }

    /// Replace the URL, keeping every other setting.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the reconnect interval.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the maximum reconnect attempts.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the liveness timeout.
    #[must_use]
    pub fn liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum inbound frame size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = Url::parse(&self.url).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!("Unsupported URL scheme: {}", url.scheme()));
        }
        if self.reconnect_interval.is_zero() {
            return Err("Reconnect interval must be > 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be > 0".to_string());
        }
        if self.liveness_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Liveness timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.reconnect_interval, Duration::from_millis(5_000));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert!(config.liveness_timeout.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_conversational_preset() {
        let config = ChannelConfig::conversational("wss://dash.example.com/ws/chat/lobby");
        assert_eq!(config.reconnect_interval, Duration::from_millis(3_000));
        assert_eq!(config.max_reconnect_attempts, 15);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(25_000));
    }

    #[test]
    fn test_infrastructure_preset_matches_defaults() {
        let config = ChannelConfig::infrastructure("wss://dash.example.com/ws/memory");
        assert_eq!(config, ChannelConfig::new("wss://dash.example.com/ws/memory"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ChannelConfig::new("wss://example.com")
            .reconnect_interval(Duration::from_millis(50))
            .max_reconnect_attempts(2)
            .heartbeat_interval(Duration::from_secs(15))
            .liveness_timeout(Some(Duration::from_secs(45)))
            .connect_timeout(Duration::from_secs(3))
            .max_message_size(1024);

        assert_eq!(config.url, "wss://example.com");
        assert_eq!(config.reconnect_interval, Duration::from_millis(50));
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.liveness_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_validation_empty_url() {
        let result = ChannelConfig::default().validate();
        assert_eq!(result.unwrap_err(), "URL cannot be empty");
    }

    #[test]
    fn test_validation_rejects_http_scheme() {
        let result = ChannelConfig::new("https://example.com").validate();
        assert_eq!(result.unwrap_err(), "Unsupported URL scheme: https");
    }

    #[test]
    fn test_validation_zero_intervals() {
        let config = ChannelConfig::new("ws://example.com").reconnect_interval(Duration::ZERO);
        assert_eq!(config.validate().unwrap_err(), "Reconnect interval must be > 0");

        let config = ChannelConfig::new("ws://example.com").heartbeat_interval(Duration::ZERO);
        assert_eq!(config.validate().unwrap_err(), "Heartbeat interval must be > 0");

        let config = ChannelConfig::new("ws://example.com").liveness_timeout(Some(Duration::ZERO));
        assert_eq!(config.validate().unwrap_err(), "Liveness timeout must be > 0");
    }

    #[test]
    fn test_zero_attempts_is_valid() {
        let config = ChannelConfig::new("ws://example.com").max_reconnect_attempts(0);
        assert!(config.validate().is_ok());
    }
}
