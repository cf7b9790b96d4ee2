//! Tokio codec for multiplexer frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, LENGTH_SIZE, MAX_FRAME_LENGTH};
use crate::opcode::OpCode;
use crate::stream_id::StreamId;

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer opened a logical stream
    Open(StreamId),
    /// Peer closed a logical stream
    Close(StreamId),
    /// Peer acknowledged our close
    CloseAck(StreamId),
    /// Peer grants `credit` more bytes for the stream
    Request { stream_id: StreamId, credit: u32 },
    /// Payload for the stream
    Transmit { stream_id: StreamId, payload: Bytes },
}

impl Frame {
    /// Stream this frame belongs to
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open(id) | Frame::Close(id) | Frame::CloseAck(id) => *id,
            Frame::Request { stream_id, .. } | Frame::Transmit { stream_id, .. } => *stream_id,
        }
    }

    /// Op-code written on the wire for this frame
    pub fn op_code(&self) -> OpCode {
        match self {
            Frame::Open(_) => OpCode::Open,
            Frame::Close(_) => OpCode::Close,
            Frame::CloseAck(_) => OpCode::CloseAck,
            Frame::Request { .. } => OpCode::Request,
            Frame::Transmit { .. } => OpCode::Transmit,
        }
    }
}

/// Codec for encoding/decoding multiplexer frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Header already consumed while waiting for the rest of the frame
    pending_header: Option<FrameHeader>,
    /// Largest TRANSMIT payload accepted or produced
    max_frame_length: usize,
}

impl FrameCodec {
    /// Create a new codec with the default frame length limit
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// Create a codec that rejects TRANSMIT payloads above `max_frame_length`
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            pending_header: None,
            max_frame_length,
        }
    }

    /// Largest TRANSMIT payload this codec accepts
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn check_length(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_length,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };
        let stream_id = header.stream_id;

        let frame = match header.op_code {
            OpCode::Open => Frame::Open(stream_id),
            OpCode::Close => Frame::Close(stream_id),
            OpCode::CloseAck => Frame::CloseAck(stream_id),
            OpCode::Request => {
                if src.len() < LENGTH_SIZE {
                    self.pending_header = Some(header);
                    return Ok(None);
                }
                Frame::Request {
                    stream_id,
                    credit: src.get_u32(),
                }
            }
            OpCode::Transmit => {
                if src.len() < LENGTH_SIZE {
                    self.pending_header = Some(header);
                    return Ok(None);
                }

                // Peek so a short payload leaves the length in place
                let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                self.check_length(length)?;

                let needed = LENGTH_SIZE + length;
                if src.len() < needed {
                    src.reserve(needed - src.len());
                    self.pending_header = Some(header);
                    return Ok(None);
                }

                src.advance(LENGTH_SIZE);
                Frame::Transmit {
                    stream_id,
                    payload: src.split_to(length).freeze(),
                }
            }
        };

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending_header.is_none() => Ok(None),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended in the middle of a frame",
            ))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        FrameHeader::new(frame.op_code(), frame.stream_id()).encode(dst);

        match frame {
            Frame::Open(_) | Frame::Close(_) | Frame::CloseAck(_) => {}
            Frame::Request { credit, .. } => {
                dst.put_u32(credit);
            }
            Frame::Transmit { payload, .. } => {
                self.check_length(payload.len())?;
                let length = u32::try_from(payload.len()).map_err(|_| {
                    ProtocolError::FrameTooLarge {
                        size: payload.len(),
                        max: u32::MAX as usize,
                    }
                })?;
                dst.reserve(LENGTH_SIZE + payload.len());
                dst.put_u32(length);
                dst.extend_from_slice(&payload);
            }
        }

        Ok(())
    }
}
