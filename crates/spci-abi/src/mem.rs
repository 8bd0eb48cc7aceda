//! Page ranges and access permissions

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::AbiError;

/// Memory is always described in 4 KiB pages, whatever the translation
/// granule of the partition.
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Access a partition holds on a memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MemAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MemAccess {
    pub const RW: MemAccess = MemAccess::READ.union(MemAccess::WRITE);

    /// Decode an access field, rejecting unknown bits.
    pub fn from_word(word: u32) -> Result<Self, AbiError> {
        u8::try_from(word)
            .ok()
            .and_then(MemAccess::from_bits)
            .ok_or(AbiError::InvalidAccess(word))
    }

    /// Access the sender keeps while a region is lent or shared.
    pub fn read_only(self) -> Self {
        self & MemAccess::READ
    }
}

/// A run of contiguous 4 KiB pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageRange {
    /// Base address (page aligned)
    pub base: u64,
    /// Number of pages
    pub page_count: u32,
}

impl PageRange {
    pub const fn new(base: u64, page_count: u32) -> Self {
        Self { base, page_count }
    }

    /// A single page starting at `base`.
    pub const fn page(base: u64) -> Self {
        Self::new(base, 1)
    }

    pub fn is_aligned(&self) -> bool {
        self.base % PAGE_SIZE == 0
    }

    /// Size in bytes, `None` on overflow.
    pub fn len(&self) -> Option<u64> {
        (self.page_count as u64).checked_mul(PAGE_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    /// Exclusive end address, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.len().and_then(|len| self.base.checked_add(len))
    }

    /// True when the two ranges share at least one page.
    pub fn overlaps(&self, other: &PageRange) -> bool {
        match (self.end(), other.end()) {
            (Some(a_end), Some(b_end)) => self.base < b_end && other.base < a_end,
            _ => true,
        }
    }

    /// Base address of every page in the range.
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        let base = self.base;
        (0..self.page_count as u64).map(move |i| base + i * PAGE_SIZE)
    }
}
