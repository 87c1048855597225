//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - kind: 1 byte (u8 tag)
//! - payload_length: 4 bytes (u32, big-endian, max 16MB)
//!
//! Payloads are opaque byte sequences. `Data` frames carry application bytes,
//! `Ping` frames carry a big-endian u64 millisecond timestamp, and `Close`
//! frames carry nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16MB)
pub const MAX_PAYLOAD_SIZE: usize = 0x0100_0000;

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload bytes
    Data = 0x01,
    /// Keepalive ping, consumed transparently by the socket layer
    Ping = 0x02,
    /// Orderly shutdown notification
    Close = 0x03,
}

impl FrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Frame header containing kind and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Kind of payload that follows
    pub kind: FrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(kind: FrameKind, payload_length: u32) -> Self {
        Self {
            kind,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.kind.as_u8());
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown frame kind).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the kind tag first to validate
        let kind_byte = src[0];
        let kind =
            FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;

        // Now consume the bytes
        let _ = src.get_u8(); // kind already parsed
        let payload_length = src.get_u32();

        Ok(Some(Self {
            kind,
            payload_length,
        }))
    }
}

/// A complete frame with kind and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Kind of this frame
    pub kind: FrameKind,
    /// Opaque payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Create a data frame carrying application bytes
    pub fn data(payload: Bytes) -> Self {
        Self::new(FrameKind::Data, payload)
    }

    /// Create a keepalive ping frame carrying a millisecond timestamp
    pub fn ping(timestamp_millis: u64) -> Self {
        Self::new(
            FrameKind::Ping,
            Bytes::copy_from_slice(&timestamp_millis.to_be_bytes()),
        )
    }

    /// Create an empty close frame
    pub fn close() -> Self {
        Self::new(FrameKind::Close, Bytes::new())
    }

    /// Read the timestamp out of a ping payload, if well-formed
    pub fn ping_timestamp(&self) -> Option<u64> {
        if self.kind != FrameKind::Ping || self.payload.len() != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Some(u64::from_be_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(FrameKind::Data, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0x01u8, 0, 0][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_unknown_frame_kind() {
        let mut buf = BytesMut::from(&[0xFEu8, 0, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameKind(0xFE))));
    }

    #[test]
    fn test_ping_timestamp() {
        let frame = Frame::ping(987654321);
        assert_eq!(frame.ping_timestamp(), Some(987654321));

        let data = Frame::data(Bytes::from_static(b"x"));
        assert_eq!(data.ping_timestamp(), None);
    }
}
