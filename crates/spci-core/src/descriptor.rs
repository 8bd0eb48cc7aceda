//! Memory region descriptor codec
//!
//! Little-endian layout:
//!
//! ```text
//! offset  size  field
//! 0       2     sender id
//! 2       2     receiver count (n)
//! 4       4     range count (m)
//! 8       4*n   receivers: u16 id, u8 access, u8 MBZ
//! 8+4n    16*m  ranges: u64 base, u32 page count, u32 MBZ
//! ```

use alloc::vec::Vec;

use spci_abi::{MemAccess, PageRange, PartitionId};
use thiserror::Error;

pub const HEADER_SIZE: usize = 8;
pub const RECEIVER_SIZE: usize = 4;
pub const RANGE_SIZE: usize = 16;

/// Descriptor decode errors
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor truncated: {needed} bytes needed, {got} available")]
    Truncated { needed: usize, got: usize },
    #[error("{0} trailing bytes after descriptor")]
    TrailingBytes(usize),
    #[error("non-zero reserved field at offset {0}")]
    NonZeroReserved(usize),
    #[error("invalid access bits {0:#x}")]
    InvalidAccess(u8),
}

/// One receiver and the access it is offered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverAccess {
    pub id: PartitionId,
    pub access: MemAccess,
}

/// Region offered by a donate, lend or share call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    pub sender: PartitionId,
    pub receivers: Vec<ReceiverAccess>,
    pub ranges: Vec<PageRange>,
}

impl MemoryRegionDescriptor {
    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.receivers.len() * RECEIVER_SIZE + self.ranges.len() * RANGE_SIZE
    }

    /// Total number of pages across all ranges
    pub fn page_count(&self) -> u64 {
        self.ranges.iter().map(|r| r.page_count as u64).sum()
    }

    /// Access offered to `receiver`
    pub fn access_for(&self, receiver: PartitionId) -> Option<MemAccess> {
        self.receivers
            .iter()
            .find(|r| r.id == receiver)
            .map(|r| r.access)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.sender.0.to_le_bytes());
        out.extend_from_slice(&(self.receivers.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for receiver in &self.receivers {
            out.extend_from_slice(&receiver.id.0.to_le_bytes());
            out.push(receiver.access.bits());
            out.push(0);
        }
        for range in &self.ranges {
            out.extend_from_slice(&range.base.to_le_bytes());
            out.extend_from_slice(&range.page_count.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out
    }

    /// Decode a descriptor occupying all of `bytes`.
    ///
    /// Only the layout is checked here. Whether the sender, receivers and
    /// ranges make sense is up to the memory engine.
    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let reader = Reader { bytes };
        let sender = PartitionId(reader.u16(0)?);
        let receiver_count = reader.u16(2)? as usize;
        let range_count = reader.u32(4)? as usize;

        let needed = HEADER_SIZE
            .saturating_add(receiver_count.saturating_mul(RECEIVER_SIZE))
            .saturating_add(range_count.saturating_mul(RANGE_SIZE));
        if bytes.len() < needed {
            return Err(DescriptorError::Truncated {
                needed,
                got: bytes.len(),
            });
        }
        if bytes.len() > needed {
            return Err(DescriptorError::TrailingBytes(bytes.len() - needed));
        }

        let mut receivers = Vec::with_capacity(receiver_count);
        for i in 0..receiver_count {
            let off = HEADER_SIZE + i * RECEIVER_SIZE;
            let id = PartitionId(reader.u16(off)?);
            let bits = reader.u8(off + 2)?;
            if reader.u8(off + 3)? != 0 {
                return Err(DescriptorError::NonZeroReserved(off + 3));
            }
            let access = MemAccess::from_bits(bits).ok_or(DescriptorError::InvalidAccess(bits))?;
            receivers.push(ReceiverAccess { id, access });
        }

        let ranges_at = HEADER_SIZE + receiver_count * RECEIVER_SIZE;
        let mut ranges = Vec::with_capacity(range_count);
        for i in 0..range_count {
            let off = ranges_at + i * RANGE_SIZE;
            let base = reader.u64(off)?;
            let page_count = reader.u32(off + 8)?;
            if reader.u32(off + 12)? != 0 {
                return Err(DescriptorError::NonZeroReserved(off + 12));
            }
            ranges.push(PageRange::new(base, page_count));
        }

        Ok(Self {
            sender,
            receivers,
            ranges,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&self, off: usize) -> Result<[u8; N], DescriptorError> {
        self.bytes
            .get(off..off + N)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or(DescriptorError::Truncated {
                needed: off + N,
                got: self.bytes.len(),
            })
    }

    fn u8(&self, off: usize) -> Result<u8, DescriptorError> {
        self.take::<1>(off).map(|b| b[0])
    }

    fn u16(&self, off: usize) -> Result<u16, DescriptorError> {
        self.take(off).map(u16::from_le_bytes)
    }

    fn u32(&self, off: usize) -> Result<u32, DescriptorError> {
        self.take(off).map(u32::from_le_bytes)
    }

    fn u64(&self, off: usize) -> Result<u64, DescriptorError> {
        self.take(off).map(u64::from_le_bytes)
    }
}
