//! Binary frame format.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! +--------------+---------+------------------------------+
//! | total_length | type_id | payload                      |
//! |   4 bytes    | 2 bytes | total_length - 6 bytes       |
//! +--------------+---------+------------------------------+
//! ```
//!
//! `total_length` counts the whole frame, including the length prefix.

use crate::error::ProtocolError;
use crate::DEFAULT_BUFFER_CAPACITY;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the fixed frame header (length prefix + type id).
pub const FRAME_HEADER_SIZE: usize = 6;

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type identifier.
    pub type_id: u16,
    /// Serialized message body.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(type_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// Total encoded length, prefix included.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let total_len = self.encoded_len();
        if total_len > i32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: i32::MAX as usize,
            });
        }

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_i32_le(total_len as i32);
        buf.put_u16_le(self.type_id);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` and consumes its bytes if a complete frame
    /// is buffered, `Ok(None)` if more data is needed, or `Err` if the
    /// declared length is malformed or exceeds `max_len`.
    pub fn decode(buf: &mut BytesMut, max_len: usize) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if declared < FRAME_HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidLength(declared));
        }

        let total_len = declared as usize;
        if total_len > max_len {
            return Err(ProtocolError::FrameTooLarge {
                size: total_len,
                max: max_len,
            });
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(LENGTH_PREFIX_SIZE);
        let type_id = frame.get_u16_le();

        Ok(Some(Self {
            type_id,
            payload: frame.freeze(),
        }))
    }
}

/// Re-assembles frames from a byte stream delivered in arbitrary chunks.
///
/// Consumed bytes are split off the front of the buffer, so whatever is
/// left always starts at the next frame boundary.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Creates a decoder whose frames may not exceed `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity.min(64 * 1024)),
            max_frame_len: capacity,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Gives direct access to the receive buffer for zero-copy socket reads.
    ///
    /// At least `additional` bytes of spare capacity are reserved first.
    pub fn read_buf(&mut self, additional: usize) -> &mut BytesMut {
        self.buffer.reserve(additional);
        &mut self.buffer
    }

    /// Attempts to decode the next complete frame.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_len)
    }

    /// Number of bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Largest frame this decoder accepts.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
