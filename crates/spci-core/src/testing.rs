//! Collaborator doubles shared by the unit tests

use alloc::vec::Vec;

use spci_abi::{MemAccess, PageRange, PartitionId, Version};
use spci_hal::{HalError, InterruptId, MemoryMapper, ResumeToken, Scheduler};
use uuid::Uuid;

use crate::state::{Limits, MonitorState};

pub const A: PartitionId = PartitionId(1);
pub const B: PartitionId = PartitionId(2);
pub const C: PartitionId = PartitionId(3);

/// Scheduler that hands out sequential tokens and records wake-ups.
#[derive(Default)]
pub struct TestScheduler {
    pub next: u64,
    pub woken: Vec<(PartitionId, ResumeToken)>,
    pub cancelled: Vec<(PartitionId, ResumeToken)>,
    pub interrupts: Vec<(PartitionId, u32)>,
    pub unavailable: bool,
}

impl Scheduler for TestScheduler {
    fn park(&mut self, _partition: PartitionId) -> Result<ResumeToken, HalError> {
        if self.unavailable {
            return Err(HalError::Unavailable);
        }
        self.next += 1;
        Ok(ResumeToken(self.next))
    }

    fn wake(&mut self, partition: PartitionId, token: ResumeToken) {
        self.woken.push((partition, token));
    }

    fn cancel(&mut self, partition: PartitionId, token: ResumeToken) {
        self.cancelled.push((partition, token));
    }

    fn pending_interrupt(&mut self, partition: PartitionId) -> Option<InterruptId> {
        let pos = self.interrupts.iter().position(|(p, _)| *p == partition)?;
        Some(InterruptId(self.interrupts.remove(pos).1))
    }
}

/// Mapper that records every change and can fail after `fail_after` calls.
#[derive(Default)]
pub struct RecordingMapper {
    pub calls: Vec<(PartitionId, u64, MemAccess)>,
    pub fail_after: Option<usize>,
}

impl MemoryMapper for RecordingMapper {
    fn set_access(
        &mut self,
        partition: PartitionId,
        range: PageRange,
        access: MemAccess,
    ) -> Result<(), HalError> {
        if let Some(n) = self.fail_after {
            if self.calls.len() >= n {
                return Err(HalError::OutOfMemory);
            }
        }
        self.calls.push((partition, range.base, access));
        Ok(())
    }
}

/// Mailbox base of partition number `i`: RX at the base, TX one page up.
pub fn mailbox_base(id: PartitionId) -> u64 {
    0x10_0000 * id.0 as u64
}

/// Partitions A, B and C, each owning two pages at its mailbox base with
/// the mailbox mapped over them.
pub fn three_partitions(limits: Limits) -> MonitorState {
    let mut state = MonitorState::new(Version::COMPILED, limits);
    for id in [A, B, C] {
        state.register_partition(id, Uuid::nil(), 1, 0).unwrap();
        let base = mailbox_base(id);
        state
            .add_memory(id, PageRange::new(base, 2), MemAccess::RW)
            .unwrap();
        state.mailboxes.map(id, base, base + 0x1000, 1).unwrap();
    }
    state
}
