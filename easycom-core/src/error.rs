//! Core error types.

use crate::lifecycle::ConnectionState;
use easycom_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("invalid state transition from {0}")]
    InvalidState(ConnectionState),

    #[error("outbound queue full ({queued} bytes queued, limit {max})")]
    OutboundFull { queued: usize, max: usize },

    #[error("pending request table full ({0} entries)")]
    TooManyPending(usize),

    #[error("endpoint {name} collides with already registered endpoint {existing}")]
    EndpointCollision { name: String, existing: String },

    #[error("a handler for message type {type_name} is already registered")]
    DuplicateHandler { type_name: &'static str },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
