//! Client error types.

use easycom_core::ConnectionState;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] easycom_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] easycom_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("client is already {0}")]
    AlreadyConnected(ConnectionState),

    #[error("address did not resolve to any host")]
    NoAddress,

    #[error("connection timeout")]
    Timeout,

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns whether a new connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ClientError::AlreadyConnected(ConnectionState::Connected).to_string(),
            "client is already connected"
        );
        assert_eq!(ClientError::Timeout.to_string(), "connection timeout");
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::AlreadyConnected(ConnectionState::Connecting).is_retryable());
    }
}
