use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of an in-memory page image in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Tablespace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// The system tablespace.
    pub const SYSTEM: SpaceId = SpaceId(0);
    /// The shared temporary tablespace.
    pub const TEMPORARY: SpaceId = SpaceId(u32::MAX - 1);
    /// Lowest id reserved for undo tablespaces.
    pub const UNDO_MIN: SpaceId = SpaceId(u32::MAX - 128);
    /// Highest id reserved for undo tablespaces.
    pub const UNDO_MAX: SpaceId = SpaceId(u32::MAX - 2);

    /// Returns true for spaces whose file identity is fixed at startup.
    ///
    /// Recovery never needs a naming record to resolve pages of these spaces.
    pub fn is_predefined(&self) -> bool {
        *self == Self::SYSTEM
            || *self == Self::TEMPORARY
            || (Self::UNDO_MIN.0..=Self::UNDO_MAX.0).contains(&self.0)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub space: SpaceId,
    pub page_no: u32,
}

impl PageId {
    pub fn new(space: u32, page_no: u32) -> Self {
        Self {
            space: SpaceId(space),
            page_no,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.space.0, self.page_no)
    }
}
