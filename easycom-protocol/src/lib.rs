//! # easycom-protocol
//!
//! Wire protocol implementation for easycom.
//!
//! This crate provides:
//! - Length-prefixed binary framing with incremental re-assembly
//! - Stable 16-bit message type identifiers and 32-bit endpoint hashes
//! - A message registry mapping type identifiers to payload codecs
//! - The built-in command/response message pair
//! - The 2-byte peer identity handshake

pub mod codec;
pub mod error;
pub mod frame;
pub mod hash;
pub mod message;
pub mod registry;

pub use codec::Codec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder, FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE};
pub use message::{CommandMsg, Message, Reply, ResponseMsg};
pub use registry::MessageRegistry;

/// Numeric identity of a peer, exchanged in the handshake.
pub type PeerId = i16;

/// Default receive buffer capacity, which also bounds the frame length (1 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Size of the handshake header written by the connecting side.
pub const HANDSHAKE_SIZE: usize = 2;

/// Encodes the handshake header carrying the connecting peer's identity.
pub fn encode_handshake(peer: PeerId) -> [u8; HANDSHAKE_SIZE] {
    peer.to_le_bytes()
}

/// Decodes the handshake header.
pub fn decode_handshake(header: [u8; HANDSHAKE_SIZE]) -> PeerId {
    PeerId::from_le_bytes(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_is_little_endian() {
        assert_eq!(encode_handshake(0x0102), [0x02, 0x01]);
        assert_eq!(decode_handshake([0xFF, 0xFF]), -1);
        assert_eq!(decode_handshake(encode_handshake(31_999)), 31_999);
    }
}
