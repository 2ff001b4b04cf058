//! Log sequence numbers as exchanged on the replication stream.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A position in the origin's write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The unset position (`0/0`).
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Formats as "X/Y" with upper-case hex halves.
impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Parses the "X/Y" form.
impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;

        let high = u32::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;

        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}
