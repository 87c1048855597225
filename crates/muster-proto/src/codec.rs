//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader, MAX_PAYLOAD_SIZE};

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Check payload length
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        // Check if we have enough data for the payload
        if src.len() < payload_len {
            // Save header and wait for more data
            self.pending_header = Some(header);
            return Ok(None);
        }

        // Extract payload
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame::new(header.kind, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        // Check payload size
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        // Encode header
        let header = FrameHeader::new(frame.kind, payload_len as u32);
        header.encode(dst);

        // Append payload
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
