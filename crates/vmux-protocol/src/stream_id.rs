//! Logical stream identifier type

use std::fmt;

/// Identifier of a logical stream on one multiplexed connection
///
/// The top bit records which endpoint allocated the id so both sides can
/// allocate concurrently without colliding. The low 15 bits are a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

impl StreamId {
    /// Bit set on ids allocated by the originating endpoint
    pub const ORIGINATOR_BIT: u16 = 0x8000;

    /// Number of distinct counter values per endpoint
    pub const COUNTER_SPACE: u16 = 0x8000;

    /// Create a new stream ID
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    /// Build an id from a local counter value and the endpoint's role
    pub fn from_counter(counter: u16, originator: bool) -> Self {
        let counter = counter % Self::COUNTER_SPACE;
        if originator {
            Self(counter | Self::ORIGINATOR_BIT)
        } else {
            Self(counter)
        }
    }

    /// Get the raw ID value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// The counter part of the id, without the origin bit
    pub fn counter(&self) -> u16 {
        self.0 & !Self::ORIGINATOR_BIT
    }

    /// Whether the id was allocated by the originating endpoint
    pub fn is_originator(&self) -> bool {
        self.0 & Self::ORIGINATOR_BIT != 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{:#06x}", self.0)
    }
}

impl From<u16> for StreamId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}
