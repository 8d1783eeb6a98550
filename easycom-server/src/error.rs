//! Server error types.

use crate::config::ConfigError;
use crate::server::ServerState;
use easycom_protocol::PeerId;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] easycom_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] easycom_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server is {0}")]
    InvalidState(ServerState),

    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
}

impl ServerError {
    /// Returns whether the error was caused by calling into the server at
    /// the wrong time rather than by a fault.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidState(_)
                | ServerError::UnknownPeer(_)
                | ServerError::Core(easycom_core::CoreError::NotConnected)
        )
    }
}
