//! Frame header encoding/decoding
//!
//! Every frame starts with a 3-byte header:
//! - op_code: 1 byte (u8)
//! - stream_id: 2 bytes (u16, big-endian)
//!
//! REQUEST and TRANSMIT frames follow the header with a 4-byte big-endian
//! length (credit delta for REQUEST, payload length for TRANSMIT). TRANSMIT
//! then carries exactly that many payload bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::opcode::OpCode;
use crate::stream_id::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 3;

/// Size of the length field carried by REQUEST and TRANSMIT
pub const LENGTH_SIZE: usize = 4;

/// Default upper bound on a TRANSMIT payload (16MB - 1)
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Frame header containing the op-code and routing information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Kind of frame
    pub op_code: OpCode,
    /// Logical stream this frame belongs to
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(op_code: OpCode, stream_id: StreamId) -> Self {
        Self { op_code, stream_id }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.op_code.as_u8());
        dst.put_u16(self.stream_id.as_u16());
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the op-code is unknown.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }

        // Validate the op-code as soon as it arrives; the rest of the stream
        // cannot be trusted after an unknown one
        let op_byte = src[0];
        let op_code = OpCode::from_u8(op_byte).ok_or(ProtocolError::UnknownOpCode(op_byte))?;

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        src.advance(1);
        let stream_id = StreamId::new(src.get_u16());

        Ok(Some(Self { op_code, stream_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(OpCode::Request, StreamId::new(0x8042));

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(&buf[..], &[0xE4, 0x80, 0x42]);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0xE1, 0x00][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_unknown_op_code() {
        let mut buf = BytesMut::from(&[0x42][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownOpCode(0x42))));
    }
}
