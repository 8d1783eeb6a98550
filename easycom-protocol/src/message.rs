//! Message types carried inside frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Status code for a successful reply.
pub const STATUS_OK: u8 = 0;

/// Synthesized locally when the owning connection tears down.
pub const STATUS_RELEASED: u8 = 254;

/// Synthesized locally when no reply arrived before the deadline.
pub const STATUS_TIMEOUT: u8 = 255;

/// A payload type that can travel in a frame.
///
/// `NAME` feeds the stable type identifier, so it must be identical on
/// both peers and unique within a process.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    /// Wire identifier derived from [`Message::NAME`].
    fn type_id() -> u16 {
        crate::hash::type_id(Self::NAME)
    }
}

/// Asks the remote peer to run a named endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMsg {
    /// Correlates the eventual [`ResponseMsg`].
    pub request_id: u16,
    /// [`crate::hash::endpoint_hash`] of the endpoint name.
    pub endpoint_hash: i32,
    /// Request body.
    pub payload: String,
}

impl Message for CommandMsg {
    const NAME: &'static str = "CommandMsg";
}

/// Answers a [`CommandMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMsg {
    pub request_id: u16,
    pub status: u8,
    pub payload: String,
}

impl Message for ResponseMsg {
    const NAME: &'static str = "ResponseMsg";
}

/// What a request resolves to.
///
/// Timeouts and disconnects are ordinary replies carrying the reserved
/// status codes, so callers always receive a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u8,
    pub payload: String,
}

impl Reply {
    pub fn new(status: u8, payload: impl Into<String>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn ok(payload: impl Into<String>) -> Self {
        Self::new(STATUS_OK, payload)
    }

    pub fn timeout() -> Self {
        Self::new(STATUS_TIMEOUT, String::new())
    }

    pub fn released() -> Self {
        Self::new(STATUS_RELEASED, String::new())
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn is_timeout(&self) -> bool {
        self.status == STATUS_TIMEOUT
    }

    pub fn is_released(&self) -> bool {
        self.status == STATUS_RELEASED
    }
}

impl From<ResponseMsg> for Reply {
    fn from(msg: ResponseMsg) -> Self {
        Self {
            status: msg.status,
            payload: msg.payload,
        }
    }
}
