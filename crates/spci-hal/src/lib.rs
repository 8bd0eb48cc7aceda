//! Collaborator traits for the SPCI monitor
//!
//! The monitor core never touches page tables or execution contexts
//! directly. It asks two collaborators for that:
//!
//! - [`Scheduler`]: parks and wakes partition execution contexts and reports
//!   pending interrupts
//! - [`MemoryMapper`]: changes the stage-2 access a partition has on a range
//!   of pages
//!
//! # Platform Implementations
//!
//! - **Firmware**: the secure partition manager's context switcher and
//!   translation-table code
//! - **Tests**: in-memory mocks that record every request

#![no_std]

use spci_abi::{MemAccess, PageRange, PartitionId, SpciError};
use thiserror::Error;

/// Identifies one suspension of a partition.
///
/// Issued by [`Scheduler::park`] and handed back to the monitor when the
/// scheduler resumes the partition. A token is valid for exactly one
/// resumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResumeToken(pub u64);

/// Physical or virtual interrupt number delivered to a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterruptId(pub u32);

/// Cooperative scheduler of partition execution contexts.
///
/// `wait`, blocking `send` and `yield` park the caller here. The scheduler
/// decides when the partition runs again and then calls back into the
/// monitor with the token it issued.
pub trait Scheduler {
    /// Suspend the current execution context of `partition`.
    ///
    /// # Returns
    /// * `Ok(ResumeToken)` - Token identifying this suspension
    /// * `Err(HalError::Unavailable)` - The context cannot be suspended now
    fn park(&mut self, partition: PartitionId) -> Result<ResumeToken, HalError>;

    /// Mark a parked partition runnable. The scheduler resumes it later with
    /// `token`.
    fn wake(&mut self, partition: PartitionId, token: ResumeToken);

    /// Withdraw `token`. The partition left its suspension through another
    /// path and must not be resumed with it.
    fn cancel(&mut self, partition: PartitionId, token: ResumeToken);

    /// Take the next interrupt pending for `partition`, if any.
    fn pending_interrupt(&mut self, partition: PartitionId) -> Option<InterruptId>;
}

/// Stage-2 access control for partition memory.
pub trait MemoryMapper {
    /// Set the access `partition` has on every page of `range`.
    ///
    /// An empty access set unmaps the range from the partition.
    ///
    /// # Returns
    /// * `Ok(())` - Access changed
    /// * `Err(HalError::OutOfMemory)` - Page-table memory exhausted
    /// * `Err(HalError::InvalidRange)` - Range not backed by memory
    fn set_access(
        &mut self,
        partition: PartitionId,
        range: PageRange,
        access: MemAccess,
    ) -> Result<(), HalError>;
}

/// Collaborator errors
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HalError {
    /// Not enough memory to complete the change
    #[error("collaborator out of memory")]
    OutOfMemory,
    /// Address range is not valid for this partition
    #[error("invalid address range")]
    InvalidRange,
    /// Platform policy forbids the change
    #[error("operation not permitted")]
    NotPermitted,
    /// Collaborator cannot service the request right now
    #[error("collaborator unavailable")]
    Unavailable,
}

impl From<HalError> for SpciError {
    fn from(value: HalError) -> Self {
        match value {
            HalError::OutOfMemory => SpciError::NoMemory,
            HalError::InvalidRange => SpciError::InvalidParameter,
            HalError::NotPermitted => SpciError::Denied,
            HalError::Unavailable => SpciError::Busy,
        }
    }
}
