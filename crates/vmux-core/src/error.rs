//! Core error types for vmux

use std::path::PathBuf;

use thiserror::Error;
use vmux_protocol::{OpCode, ProtocolError, StreamId};

/// Errors surfaced by the multiplexer and its virtual connections
#[derive(Error, Debug)]
pub enum MuxError {
    /// The underlying byte stream failed; the multiplexer has shut down
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer broke the framing protocol; the multiplexer has shut down
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The virtual connection was closed, or its multiplexer shut down
    #[error("Connection closed")]
    ConnectionClosed,

    /// The live-connection ceiling has been reached
    #[error("Connection limit of {max} reached")]
    CapacityExceeded { max: usize },

    /// `run()` was called while another receive loop owns the stream
    #[error("Multiplexer is already running")]
    AlreadyRunning,

    /// Invalid multiplexer configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MuxError {
    /// Whether this error tears down the whole multiplexer
    pub fn is_fatal(&self) -> bool {
        matches!(self, MuxError::Transport(_) | MuxError::Protocol(_))
    }
}

impl From<ProtocolError> for MuxError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => MuxError::Transport(e),
            other => MuxError::Protocol(ProtocolViolation::Frame(other)),
        }
    }
}

/// Ways in which a peer can violate the framing protocol
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    /// Malformed frame (unknown op-code, oversized payload)
    #[error("{0}")]
    Frame(ProtocolError),

    /// OPEN for an id that is already in use
    #[error("OPEN for {0} which is already open")]
    DuplicateOpen(StreamId),

    /// Frame referencing an id that is not open
    #[error("{op} for unknown {id}")]
    UnknownStream { op: OpCode, id: StreamId },

    /// CLOSEACK for a stream we never sent CLOSE on
    #[error("CLOSEACK for {0} without a prior CLOSE")]
    UnsolicitedCloseAck(StreamId),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
