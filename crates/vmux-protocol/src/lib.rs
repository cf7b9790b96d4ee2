//! vmux-protocol: Wire protocol for vmux virtual connection multiplexing
//!
//! This crate defines the binary framing used to carry many logical,
//! flow-controlled virtual connections over one ordered byte stream.

pub mod codec;
pub mod error;
pub mod frame;
pub mod opcode;
pub mod stream_id;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, LENGTH_SIZE, MAX_FRAME_LENGTH};
pub use opcode::OpCode;
pub use stream_id::StreamId;
