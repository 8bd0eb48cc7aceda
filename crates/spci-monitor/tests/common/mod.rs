//! Shared mocks and builders for the monitor integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;

use spci_abi::{
    CallWidth, MemAccess, PageRange, PartitionId, Registers, Response, SendAttributes, Version,
};
use spci_core::{CallOutcome, Handle, MemoryRegionDescriptor, ReceiverAccess, SpciCall};
use spci_hal::{HalError, InterruptId, MemoryMapper, ResumeToken, Scheduler};
use spci_monitor::{MemoryConfig, Monitor, MonitorConfig, PartitionConfig};
use uuid::Uuid;

pub const A: PartitionId = PartitionId(1);
pub const B: PartitionId = PartitionId(2);
pub const C: PartitionId = PartitionId(3);

pub const PAGE: u64 = 0x1000;

// ============================================================================
// Mock collaborators
// ============================================================================

/// Scheduler that issues sequential tokens and records wake-ups.
///
/// `woken` holds the tokens it would resume; a cancelled token leaves it.
#[derive(Default)]
pub struct MockScheduler {
    next_token: u64,
    pub parked: Vec<(PartitionId, ResumeToken)>,
    pub woken: Vec<(PartitionId, ResumeToken)>,
    pub cancelled: Vec<(PartitionId, ResumeToken)>,
    pub interrupts: Vec<(PartitionId, InterruptId)>,
}

impl MockScheduler {
    pub fn raise(&mut self, partition: PartitionId, irq: u32) {
        self.interrupts.push((partition, InterruptId(irq)));
    }

    pub fn was_woken(&self, partition: PartitionId, token: ResumeToken) -> bool {
        self.woken.contains(&(partition, token))
    }

    pub fn was_cancelled(&self, partition: PartitionId, token: ResumeToken) -> bool {
        self.cancelled.contains(&(partition, token))
    }
}

impl Scheduler for MockScheduler {
    fn park(&mut self, partition: PartitionId) -> Result<ResumeToken, HalError> {
        self.next_token += 1;
        let token = ResumeToken(self.next_token);
        self.parked.push((partition, token));
        Ok(token)
    }

    fn wake(&mut self, partition: PartitionId, token: ResumeToken) {
        self.woken.push((partition, token));
    }

    fn cancel(&mut self, partition: PartitionId, token: ResumeToken) {
        self.woken.retain(|entry| *entry != (partition, token));
        self.cancelled.push((partition, token));
    }

    fn pending_interrupt(&mut self, partition: PartitionId) -> Option<InterruptId> {
        let pos = self.interrupts.iter().position(|(p, _)| *p == partition)?;
        Some(self.interrupts.remove(pos).1)
    }
}

/// Mapper that keeps a per-page access table, like a stage-2 page table.
#[derive(Default)]
pub struct MockMapper {
    table: BTreeMap<(PartitionId, u64), MemAccess>,
    /// Number of `set_access` calls seen, failed ones included
    pub calls: usize,
    /// Index of the one call that fails with `OutOfMemory`
    pub fail_call: Option<usize>,
}

impl MockMapper {
    pub fn access(&self, partition: PartitionId, page: u64) -> MemAccess {
        self.table
            .get(&(partition, page))
            .copied()
            .unwrap_or(MemAccess::empty())
    }
}

impl MemoryMapper for MockMapper {
    fn set_access(
        &mut self,
        partition: PartitionId,
        range: PageRange,
        access: MemAccess,
    ) -> Result<(), HalError> {
        let index = self.calls;
        self.calls += 1;
        if self.fail_call == Some(index) {
            return Err(HalError::OutOfMemory);
        }
        for page in range.pages() {
            if access.is_empty() {
                self.table.remove(&(partition, page));
            } else {
                self.table.insert((partition, page), access);
            }
        }
        Ok(())
    }
}

pub type TestMonitor = Monitor<MockScheduler, MockMapper>;

// ============================================================================
// Layout
// ============================================================================

/// RX page of a partition; TX is the page after it.
pub fn rx_base(id: PartitionId) -> u64 {
    0x10_0000 * id.0 as u64
}

pub fn tx_base(id: PartitionId) -> u64 {
    rx_base(id) + PAGE
}

/// First page of a partition's four-page data region.
pub fn region(id: PartitionId) -> u64 {
    0x8000_0000 + 0x10_0000 * id.0 as u64
}

pub fn partition_config(id: PartitionId) -> PartitionConfig {
    PartitionConfig {
        id,
        uuid: Uuid::from_u128(id.0 as u128),
        execution_contexts: 1,
        properties: 0,
        memory: vec![
            MemoryConfig {
                base: rx_base(id),
                page_count: 2,
                access: MemAccess::RW,
            },
            MemoryConfig {
                base: region(id),
                page_count: 4,
                access: MemAccess::RW,
            },
        ],
    }
}

pub fn config() -> MonitorConfig {
    MonitorConfig {
        check_invariants: true,
        partitions: vec![partition_config(A), partition_config(B), partition_config(C)],
        ..MonitorConfig::default()
    }
}

/// A, B and C registered but not yet negotiated or mapped.
pub fn fresh_monitor() -> TestMonitor {
    Monitor::new(config(), MockScheduler::default(), MockMapper::default()).unwrap()
}

/// A, B and C negotiated with their mailboxes mapped.
pub fn monitor() -> TestMonitor {
    let mut monitor = fresh_monitor();
    for id in [A, B, C] {
        assert_eq!(
            call(&mut monitor, id, SpciCall::Version {
                requested: Version::COMPILED.to_word()
            }),
            Response::Version(Version::COMPILED)
        );
        assert_success(call(&mut monitor, id, SpciCall::RxTxMap {
            tx_addr: tx_base(id),
            rx_addr: rx_base(id),
            page_count: 1,
        }));
    }
    monitor
}

// ============================================================================
// Calls
// ============================================================================

pub fn outcome(monitor: &mut TestMonitor, caller: PartitionId, call: SpciCall) -> CallOutcome {
    monitor.handle_call(caller, &call.to_registers(CallWidth::Smc32))
}

/// Issue an SMC32 call that must return to the caller.
pub fn call(monitor: &mut TestMonitor, caller: PartitionId, call: SpciCall) -> Response {
    match outcome(monitor, caller, call) {
        CallOutcome::Return(response) => response,
        other => panic!("Expected Return, got {:?}", other),
    }
}

pub fn regs(monitor: &mut TestMonitor, caller: PartitionId, registers: Registers) -> Response {
    match monitor.handle_call(caller, &registers) {
        CallOutcome::Return(response) => response,
        other => panic!("Expected Return, got {:?}", other),
    }
}

pub fn assert_success(response: Response) {
    assert!(response.is_success(), "Expected Success, got {:?}", response);
}

pub fn send(
    monitor: &mut TestMonitor,
    from: PartitionId,
    to: PartitionId,
    bytes: &[u8],
    attributes: SendAttributes,
) -> CallOutcome {
    monitor.write_tx(from, bytes).unwrap();
    outcome(monitor, from, SpciCall::MsgSend {
        source: from,
        destination: to,
        length: bytes.len() as u32,
        attributes,
    })
}

/// Descriptor for `count` pages of `sender`'s data region.
pub fn descriptor(
    sender: PartitionId,
    receivers: &[(PartitionId, MemAccess)],
    first_page: u64,
    count: u32,
) -> MemoryRegionDescriptor {
    MemoryRegionDescriptor {
        sender,
        receivers: receivers
            .iter()
            .map(|(id, access)| ReceiverAccess {
                id: *id,
                access: *access,
            })
            .collect(),
        ranges: vec![PageRange::new(region(sender) + first_page * PAGE, count)],
    }
}

/// Write `desc` to the sender's TX and start the transaction.
pub fn transfer(
    monitor: &mut TestMonitor,
    kind: spci_core::TransactionKind,
    desc: &MemoryRegionDescriptor,
) -> Response {
    let bytes = desc.encode();
    monitor.write_tx(desc.sender, &bytes).unwrap();
    call(monitor, desc.sender, SpciCall::MemTransfer {
        kind,
        total_length: bytes.len() as u32,
        fragment_length: bytes.len() as u32,
    })
}

/// Handle carried by a transfer's success response.
pub fn handle_of(response: &Response) -> Handle {
    match response {
        Response::Success { results, .. } => {
            Handle::from_words(results[0] as u32, results[1] as u32)
        }
        other => panic!("Expected Success, got {:?}", other),
    }
}

/// Full retrieve handshake by `receiver`, then release its RX.
pub fn retrieve(monitor: &mut TestMonitor, receiver: PartitionId, handle: Handle) {
    let reply = call(monitor, receiver, SpciCall::MemRetrieveReq {
        handle,
        access: MemAccess::empty(),
    });
    assert!(
        matches!(reply, Response::Call { .. }),
        "Expected MEM_RETRIEVE_RESP, got {:?}",
        reply
    );
    assert_success(call(monitor, receiver, SpciCall::MemRetrieveResp { handle }));
    assert_success(call(monitor, receiver, SpciCall::RxRelease));
}

/// Every invariant holds and the mapper agrees with the ownership records.
pub fn assert_consistent(monitor: &TestMonitor) {
    let violations = monitor.check_invariants();
    assert!(violations.is_empty(), "violations: {:?}", violations);
    assert!(monitor.audit().verify_integrity());
    for id in [A, B, C] {
        for page in [A, B, C]
            .into_iter()
            .flat_map(|owner| (0..4).map(move |i| region(owner) + i * PAGE))
        {
            assert_eq!(
                monitor.mapper().access(id, page),
                monitor.state().memory.expected_access(id, page),
                "access of {} on {:#x}",
                id,
                page
            );
        }
    }
}
