//! SPCI ABI - call identifiers, error codes and register encodings
//!
//! This crate is the single source of truth for the numbers that travel
//! between a secure partition and the monitor. It has no state and performs
//! no I/O: every function here is a pure decode or encode.
//!
//! # Function Identifier Layout
//!
//! | Bits  | Field              | SPCI value                 |
//! |-------|--------------------|----------------------------|
//! | 31    | Call type          | 1 (fast call)              |
//! | 30    | Calling convention | 0 = SMC32, 1 = SMC64       |
//! | 29:24 | Owning entity      | 4 (standard secure service)|
//! | 23:16 | Reserved           | 0                          |
//! | 15:0  | Function number    | `0x60..=0x7F`              |
//!
//! # Module Organization
//!
//! - `fid` - Function numbers, calling-convention width and the decoder
//! - `version` - Packed `(major, minor)` version word
//! - `attrs` - Message-send attribute word
//! - `mem` - Page ranges and access permissions
//! - `error` - Wire error codes and decode failures
//! - `regs` - Register file and response encoding

#![cfg_attr(not(test), no_std)]

pub mod attrs;
pub mod error;
pub mod fid;
pub mod mem;
pub mod regs;
pub mod version;

pub use attrs::SendAttributes;
pub use error::{AbiError, SpciError};
pub use fid::{is_spci_fid, spci_fid, CallWidth, Function, FunctionId};
pub use mem::{MemAccess, PageRange, PAGE_SIZE};
pub use regs::{Registers, Response};
pub use version::Version;

use serde::{Deserialize, Serialize};

/// Reserved target-info value for traffic addressed to the monitor itself.
pub const TARGET_INFO_MBZ: u32 = 0;

/// Reserved value for must-be-zero parameters.
pub const PARAM_MBZ: u32 = 0;

/// Secure partition identifier.
///
/// Partition ids are 16 bits wide on the wire. `MONITOR_ID` is reserved for
/// the monitor and never names a registered partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u16);

impl PartitionId {
    /// The monitor's own id
    pub const MONITOR: PartitionId = PartitionId(0);

    /// Unpack a `source << 16 | destination` pair.
    pub fn unpack_pair(word: u32) -> (PartitionId, PartitionId) {
        (PartitionId((word >> 16) as u16), PartitionId(word as u16))
    }

    /// Pack a `source << 16 | destination` pair.
    pub fn pack_pair(source: PartitionId, destination: PartitionId) -> u32 {
        ((source.0 as u32) << 16) | destination.0 as u32
    }

    /// Target-info word: the id in the upper half, the lower half MBZ.
    pub fn target_info(self) -> u32 {
        (self.0 as u32) << 16
    }
}

impl core::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
