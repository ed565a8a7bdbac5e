//! Error taxonomy for the event-channel core.
//!
//! Runtime failures never cross the public API as `Err`: transport failures
//! are delivered through the `error` event, parse failures are logged and
//! dropped, exhaustion is delivered once through `reconnect_failed`. The
//! `Err` path is reserved for construction-time mistakes such as an invalid
//! configuration.

use std::time::Duration;

use thiserror::Error;

/// The result type used throughout the channel layer.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error type for all channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Socket-level failure. Non-fatal: the reconnection cycle continues.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed or non-conforming inbound frame.
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Reconnect attempts exceeded the configured cap.
    #[error("Connection exhausted after {attempts} reconnect attempts")]
    ConnectionExhausted { attempts: u32 },

    /// Outbound send attempted while not connected.
    #[error("Cannot send while disconnected")]
    SendWhileDisconnected,

    /// Serialization of an outbound message failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation timed out.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// No async runtime was available to drive a connection.
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

impl ChannelError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Whether the failure belongs to the transport (and therefore feeds the
    /// reconnection cycle rather than being a caller mistake).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ChannelError::config("URL cannot be empty");
        assert!(matches!(err, ChannelError::Config { .. }));

        let err = ChannelError::timeout(Duration::from_secs(5));
        assert!(matches!(err, ChannelError::Timeout { .. }));

        let err = ChannelError::parse("missing type");
        assert!(matches!(err, ChannelError::Parse { .. }));
    }

    #[test]
    fn test_transport_classification() {
        assert!(ChannelError::transport("reset by peer").is_transport());
        assert!(ChannelError::timeout(Duration::from_secs(1)).is_transport());
        assert!(!ChannelError::SendWhileDisconnected.is_transport());
        assert!(!ChannelError::ConnectionExhausted { attempts: 3 }.is_transport());
    }

    #[test]
    fn test_display() {
        let err = ChannelError::ConnectionExhausted { attempts: 10 };
        assert_eq!(
            err.to_string(),
            "Connection exhausted after 10 reconnect attempts"
        );
    }
}
