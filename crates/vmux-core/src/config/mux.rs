//! Multiplexer configuration

use serde::{Deserialize, Serialize};
use vmux_protocol::{StreamId, MAX_FRAME_LENGTH};

use crate::error::ConfigError;

/// Default per-stream buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default ceiling on simultaneously open virtual connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Tunables for one multiplexed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Size of each virtual connection's input and output buffer.
    ///
    /// The input buffer size also bounds how much credit is granted to the
    /// peer at once.
    pub buffer_size: usize,

    /// Maximum number of simultaneously open virtual connections.
    ///
    /// Must not exceed the 15-bit id space of one endpoint.
    pub max_connections: usize,

    /// Largest TRANSMIT payload accepted from the peer
    pub max_frame_length: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl MuxConfig {
    /// Check that the values can be used to build a multiplexer
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero".into()));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} does not fit a 32-bit credit grant",
                self.buffer_size
            )));
        }
        if self.max_connections == 0 || self.max_connections > StreamId::COUNTER_SPACE as usize {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be between 1 and {}",
                StreamId::COUNTER_SPACE
            )));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_length must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
