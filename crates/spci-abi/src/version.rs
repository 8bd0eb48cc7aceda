//! Packed version word
//!
//! `major` occupies bits 30:16 (15 bits), `minor` bits 15:0. Bit 31 must be
//! zero.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AbiError;

pub const VERSION_MAJOR_SHIFT: u32 = 16;
pub const VERSION_MAJOR_MASK: u32 = 0x7FFF;
pub const VERSION_MINOR_SHIFT: u32 = 0;
pub const VERSION_MINOR_MASK: u32 = 0xFFFF;
const VERSION_MBZ: u32 = 1 << 31;

/// An SPCI protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// The version implemented by this crate.
    pub const COMPILED: Version = Version { major: 0, minor: 9 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Pack into a version word. The major number is truncated to 15 bits.
    pub fn to_word(self) -> u32 {
        ((self.major as u32 & VERSION_MAJOR_MASK) << VERSION_MAJOR_SHIFT)
            | ((self.minor as u32 & VERSION_MINOR_MASK) << VERSION_MINOR_SHIFT)
    }

    /// Unpack a version word, rejecting words with bit 31 set.
    pub fn from_word(word: u32) -> Result<Self, AbiError> {
        if word & VERSION_MBZ != 0 {
            return Err(AbiError::InvalidVersion(word));
        }
        Ok(Self {
            major: ((word >> VERSION_MAJOR_SHIFT) & VERSION_MAJOR_MASK) as u16,
            minor: ((word >> VERSION_MINOR_SHIFT) & VERSION_MINOR_MASK) as u16,
        })
    }

    /// A caller asking for `requested` can be served by `self` when the
    /// major numbers match.
    pub fn is_compatible_with(self, requested: Version) -> bool {
        self.major == requested.major
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::COMPILED
    }
}

impl TryFrom<u32> for Version {
    type Error = AbiError;

    fn try_from(word: u32) -> Result<Self, Self::Error> {
        Self::from_word(word)
    }
}

impl From<Version> for u32 {
    fn from(version: Version) -> Self {
        version.to_word()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
