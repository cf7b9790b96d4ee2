//! Frame op-codes
//!
//! The protocol has a fixed set of five frame kinds. Each frame starts with
//! one op-code byte followed by the 16-bit logical stream id.
//!
//! # Frame Flow
//!
//! 1. Either side sends `Open` for an id it allocated
//! 2. The receiving side grants credit with `Request`
//! 3. The sending side pushes at most that many bytes with `Transmit`
//! 4. Either side sends `Close`; the other answers `CloseAck` unless it had
//!    already sent its own `Close`

use std::fmt;

/// Frame op-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Open a new logical stream
    Open = 0xE1,
    /// Close a logical stream
    Close = 0xE2,
    /// Acknowledge a peer's close
    CloseAck = 0xE3,
    /// Grant the peer credit to send more bytes
    Request = 0xE4,
    /// Payload bytes for a logical stream
    Transmit = 0xE5,
}

impl OpCode {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xE1 => Some(Self::Open),
            0xE2 => Some(Self::Close),
            0xE3 => Some(Self::CloseAck),
            0xE4 => Some(Self::Request),
            0xE5 => Some(Self::Transmit),
            _ => None,
        }
    }

    /// Whether a 32-bit length field follows the stream id
    pub fn has_length(&self) -> bool {
        matches!(self, Self::Request | Self::Transmit)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Open => "OPEN",
            OpCode::Close => "CLOSE",
            OpCode::CloseAck => "CLOSEACK",
            OpCode::Request => "REQUEST",
            OpCode::Transmit => "TRANSMIT",
        };
        f.write_str(name)
    }
}
