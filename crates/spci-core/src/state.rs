//! Monitor state - pure data structure holding all protocol state
//!
//! `MonitorState` owns the partition table, the mailboxes, the page
//! ownership table and the outstanding direct requests. It is created per
//! monitor instance and passed by reference to the engines; there is no
//! global registry.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spci_abi::{MemAccess, PageRange, PartitionId, Version};
use thiserror::Error;
use uuid::Uuid;

use crate::mailbox::Mailboxes;
use crate::memory::MemoryState;
use crate::types::{Partition, PartitionInfo};

/// Capacity limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Largest page count accepted by `RXTX_MAP`
    pub max_mailbox_pages: u32,
    /// Maximum number of live memory transactions
    pub max_transactions: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_mailbox_pages: 1,
            max_transactions: 64,
        }
    }
}

/// Errors while populating the state at boot
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("partition id {0} is reserved")]
    ReservedPartitionId(PartitionId),
    #[error("partition {0} already registered")]
    DuplicatePartition(PartitionId),
    #[error("partition {0} not registered")]
    UnknownPartition(PartitionId),
    #[error("memory range at {0:#x} is not page aligned or empty")]
    InvalidRange(u64),
    #[error("page {0:#x} already has an owner")]
    PageAlreadyOwned(u64),
}

/// The pure monitor state - no collaborators, no I/O.
pub struct MonitorState {
    /// Version implemented by this monitor
    pub version: Version,
    /// Partition table
    pub partitions: BTreeMap<PartitionId, Partition>,
    /// RX/TX mailboxes
    pub mailboxes: Mailboxes,
    /// Page ownership and memory transactions
    pub memory: MemoryState,
    /// Outstanding direct requests, responder -> requester
    pub direct_requests: BTreeMap<PartitionId, PartitionId>,
}

impl MonitorState {
    /// Create an empty state.
    pub fn new(version: Version, limits: Limits) -> Self {
        Self {
            version,
            partitions: BTreeMap::new(),
            mailboxes: Mailboxes::new(limits.max_mailbox_pages),
            memory: MemoryState::new(limits.max_transactions),
            direct_requests: BTreeMap::new(),
        }
    }

    /// Register a partition.
    pub fn register_partition(
        &mut self,
        id: PartitionId,
        uuid: Uuid,
        execution_contexts: u16,
        properties: u32,
    ) -> Result<(), StateError> {
        if id == PartitionId::MONITOR {
            return Err(StateError::ReservedPartitionId(id));
        }
        if self.partitions.contains_key(&id) {
            return Err(StateError::DuplicatePartition(id));
        }
        self.partitions
            .insert(id, Partition::new(id, uuid, execution_contexts, properties));
        Ok(())
    }

    /// Give `owner` the pages of `range` with `access`.
    pub fn add_memory(
        &mut self,
        owner: PartitionId,
        range: PageRange,
        access: MemAccess,
    ) -> Result<(), StateError> {
        if !self.partitions.contains_key(&owner) {
            return Err(StateError::UnknownPartition(owner));
        }
        if !range.is_aligned() || range.is_empty() || range.end().is_none() {
            return Err(StateError::InvalidRange(range.base));
        }
        if let Some(page) = range.pages().find(|p| self.memory.page(*p).is_some()) {
            return Err(StateError::PageAlreadyOwned(page));
        }
        self.memory.insert_owned(owner, range, access);
        Ok(())
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partition_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.partitions.get_mut(&id)
    }

    pub fn is_registered(&self, id: PartitionId) -> bool {
        self.partitions.contains_key(&id)
    }

    /// Negotiated version of `id`
    pub fn negotiated(&self, id: PartitionId) -> Option<Version> {
        self.partitions.get(&id).and_then(|p| p.version)
    }

    /// Partitions matching `uuid`; the nil UUID matches all of them.
    pub fn partition_infos(&self, uuid: &Uuid) -> Vec<PartitionInfo> {
        self.partitions
            .values()
            .filter(|p| uuid.is_nil() || p.uuid == *uuid)
            .map(|p| PartitionInfo {
                id: p.id,
                execution_contexts: p.execution_contexts,
                properties: p.properties,
            })
            .collect()
    }
}
