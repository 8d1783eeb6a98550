//! Payload serialization.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialization format used for message payloads.
///
/// Framing and routing never look inside a payload, so the format is
/// interchangeable as long as both peers agree on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// JSON via `serde_json`.
    #[default]
    Json,
}

impl Codec {
    /// Serializes a value into payload bytes.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserializes payload bytes into a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}
