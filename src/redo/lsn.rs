use serde::{Deserialize, Serialize};
use std::fmt;

/// Log Sequence Number: byte position in the redo stream.
///
/// LSNs grow by exactly the number of bytes appended, so the distance between
/// two LSNs is the amount of redo written between them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Never a valid position; a page whose oldest modification is `ZERO` is clean.
    pub const ZERO: Lsn = Lsn(0);
    /// LSN of the first byte ever written.
    pub const START: Lsn = Lsn(8192);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn advance(&self, bytes: usize) -> Lsn {
        Lsn(self.0 + bytes as u64)
    }

    /// Number of bytes from `earlier` to `self`; zero if `earlier` is ahead.
    pub fn distance_from(&self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_arithmetic() {
        let lsn = Lsn::START.advance(100);
        assert_eq!(lsn, Lsn(8292));
        assert_eq!(lsn.distance_from(Lsn::START), 100);
        assert_eq!(Lsn::START.distance_from(lsn), 0);
        assert!(Lsn::ZERO.is_zero());
        assert!(!Lsn::START.is_zero());
    }
}
