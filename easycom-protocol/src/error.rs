//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame length: {0}")]
    InvalidLength(i32),

    #[error("unknown message type: {0:#06x}")]
    UnknownMessageType(u16),

    #[error("message type {0} is not registered")]
    UnregisteredType(&'static str),

    #[error("message type id {id:#06x} of {new} collides with {existing}")]
    TypeIdCollision {
        id: u16,
        existing: &'static str,
        new: &'static str,
    },

    #[error("message type id {id:#06x} belongs to {registered}, not {requested}")]
    TypeMismatch {
        id: u16,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns whether the error means the peer sent something we cannot route.
    ///
    /// Such errors terminate the offending connection but never the process.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::InvalidLength(_)
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::Json(_)
        )
    }
}
