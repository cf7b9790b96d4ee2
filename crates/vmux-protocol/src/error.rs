//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown op-code byte at the start of a frame
    #[error("Unknown op-code: {0:#04x}")]
    UnknownOpCode(u8),

    /// TRANSMIT length exceeds the configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error came from the underlying byte stream rather than
    /// from the bytes it carried
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
