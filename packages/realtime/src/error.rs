//! Error types for the realtime transport layer
//!
//! Connection-level failures are absorbed by the pool (health penalty plus a
//! scheduled reconnect) and reach callers only as aggregate connection-state
//! transitions. Message-level failures surface exactly once through a queue
//! `Failed` event and are then dropped.

use thiserror::Error;

/// Unified error type for realtime transport operations
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Opening a transport connection exceeded the configured deadline
    #[error("connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectionTimeout { endpoint: String, timeout_ms: u64 },

    /// Transport-level failure; triggers the backoff reconnect path
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Pool is at capacity and no existing connection can take the channel
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A queued message exhausted its retries
    #[error("message delivery failed: {0}")]
    MessageDeliveryFailed(String),

    /// Presence semantics requested on a channel that does not support them
    #[error("presence not supported for channel: {0}")]
    PresenceUnsupported(String),

    /// Malformed inbound payload
    #[error("parse error: {0}")]
    Parse(String),

    /// Underlying websocket transport error
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl RealtimeError {
    /// Whether this error should feed the pool's backoff reconnect path
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::ConnectionFailed(_) | Self::Transport(_)
        )
    }
}

/// Result type alias for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RealtimeError::ConnectionTimeout {
            endpoint: "ws://localhost:9000".to_string(),
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "connection to ws://localhost:9000 timed out after 10000ms"
        );

        let err = RealtimeError::PresenceUnsupported("tournament-42".to_string());
        assert_eq!(
            err.to_string(),
            "presence not supported for channel: tournament-42"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RealtimeError::ConnectionFailed("reset".into()).is_retryable());
        assert!(!RealtimeError::PoolExhausted.is_retryable());
        assert!(!RealtimeError::Configuration("missing key".into()).is_retryable());
    }
}
