//! Dispatcher - one decoded call in, one outcome out
//!
//! `step(state, scheduler, mapper, caller, fid, call)` is the single entry
//! point for a partition's call. It applies the preconditions every call
//! shares, routes the call to the engine that owns it and turns every
//! engine error into a wire error code.
//!
//! # Preconditions (checked in order)
//!
//! 1. The caller is a registered partition
//! 2. The caller negotiated a version, unless the call is `VERSION`
//! 3. The caller has a mailbox, if the call needs one
//!
//! # Design
//!
//! Handlers validate fully before mutating, so a failed call leaves the
//! state untouched and produces no commits. Every mutation that does happen
//! is described by a [`CommitType`] for the audit log.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use spci_abi::{
    AbiError, CallWidth, Function, FunctionId, MemAccess, PageRange, PartitionId, Response,
    SpciError, Version,
};
use spci_hal::{MemoryMapper, ResumeToken, Scheduler};
use thiserror::Error;
use uuid::Uuid;

use crate::call::SpciCall;
use crate::mailbox::{MailboxError, RxPayload};
use crate::memory::{self, MemoryError};
use crate::message::{self, MessageError};
use crate::state::MonitorState;
use crate::types::{CallOutcome, Handle, ParkReason, PartitionInfo, TransactionKind};

// ============================================================================
// Commit types for audit log
// ============================================================================

/// Commit types - describe state mutations for audit/replay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    /// Genesis commit (initial state)
    Genesis,
    /// Partition registered at boot
    PartitionRegistered { partition: PartitionId },
    /// Version negotiated
    VersionNegotiated {
        partition: PartitionId,
        version: Version,
    },
    /// RX/TX buffers bound
    MailboxMapped {
        partition: PartitionId,
        rx_addr: u64,
        tx_addr: u64,
        page_count: u32,
    },
    /// RX/TX buffers released
    MailboxUnmapped { partition: PartitionId },
    /// RX buffer handed back
    RxReleased { partition: PartitionId },
    /// Partition info list written to RX
    PartitionInfoStaged { partition: PartitionId, count: u32 },
    /// Indirect message staged
    MessageSent {
        source: PartitionId,
        destination: PartitionId,
        length: u32,
        blocking: bool,
    },
    /// Indirect message read by its destination
    MessageDelivered {
        source: PartitionId,
        destination: PartitionId,
    },
    /// Partition suspended
    Parked {
        partition: PartitionId,
        reason: ParkReason,
    },
    /// Parked call completed
    Resumed { partition: PartitionId },
    /// Parked call cancelled
    Interrupted {
        partition: PartitionId,
        interrupt_id: u32,
    },
    /// Direct request handed to its destination
    DirectRequest {
        source: PartitionId,
        destination: PartitionId,
    },
    /// Direct response handed back to the requester
    DirectResponse {
        source: PartitionId,
        destination: PartitionId,
    },
    /// Donate, lend or share started
    TransactionCreated {
        handle: Handle,
        kind: TransactionKind,
        sender: PartitionId,
        receivers: Vec<PartitionId>,
        pages: u64,
    },
    /// Receiver asked for the region
    RetrieveRequested {
        handle: Handle,
        receiver: PartitionId,
        access: MemAccess,
    },
    /// Region mapped into a borrower
    Retrieved {
        handle: Handle,
        receiver: PartitionId,
        access: MemAccess,
    },
    /// Donation completed
    Donated {
        handle: Handle,
        from: PartitionId,
        to: PartitionId,
    },
    /// Borrower gave the region back
    Relinquished { handle: Handle, borrower: PartitionId },
    /// Owner took the region back
    Reclaimed { handle: Handle, sender: PartitionId },
    /// Pages back with their owner, transaction forgotten
    TransactionClosed { handle: Handle },
}

/// Result of a step operation
#[derive(Clone, Debug)]
pub struct StepResult {
    /// What the trapping layer does next
    pub outcome: CallOutcome,
    /// Commits generated by this step
    pub commits: Vec<CommitType>,
}

// ============================================================================
// Errors
// ============================================================================

/// Why a call failed
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("{0} is not a registered partition")]
    UnknownCaller(PartitionId),
    #[error("{0} has not negotiated a version")]
    NotNegotiated(PartitionId),
    #[error("{0} has no mailbox")]
    NoMailbox(PartitionId),
    #[error("{0} is a response code, not a call")]
    ResponseCode(Function),
    #[error("requested version {0:#010x} is not supported")]
    IncompatibleVersion(u32),
    #[error("function {0:#010x} not implemented")]
    NotImplemented(u32),
    #[error("buffer at {0:#x} is not owned by the caller")]
    BufferNotOwned(u64),
    #[error("cannot unmap the mailbox of {0}")]
    ForeignMailbox(PartitionId),
    #[error("no partition matches {0}")]
    NoMatchingPartition(Uuid),
    #[error("partition info needs {len} bytes, RX holds {capacity}")]
    InfoTooLarge { len: usize, capacity: usize },
    #[error("decode: {0}")]
    Abi(#[from] AbiError),
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("{0}")]
    Message(#[from] MessageError),
    #[error("{0}")]
    Memory(#[from] MemoryError),
}

impl From<StepError> for SpciError {
    fn from(value: StepError) -> Self {
        match value {
            StepError::UnknownCaller(_)
            | StepError::BufferNotOwned(_)
            | StepError::ForeignMailbox(_)
            | StepError::NoMatchingPartition(_) => SpciError::InvalidParameter,
            StepError::NotNegotiated(_) | StepError::NoMailbox(_) => SpciError::Denied,
            StepError::ResponseCode(_)
            | StepError::IncompatibleVersion(_)
            | StepError::NotImplemented(_) => SpciError::NotSupported,
            StepError::InfoTooLarge { .. } => SpciError::NoMemory,
            StepError::Abi(e) => e.into(),
            StepError::Mailbox(e) => e.into(),
            StepError::Message(e) => e.into(),
            StepError::Memory(e) => e.into(),
        }
    }
}

// ============================================================================
// The step function
// ============================================================================

/// Execute one call of `caller` against the monitor state.
///
/// Never fails: errors come back as an `SPCI_ERROR` response.
pub fn step<S: Scheduler, M: MemoryMapper>(
    state: &mut MonitorState,
    sched: &mut S,
    mapper: &mut M,
    caller: PartitionId,
    fid: FunctionId,
    call: SpciCall,
) -> StepResult {
    let mut commits = Vec::new();
    let outcome = match dispatch(state, sched, mapper, caller, fid, call, &mut commits) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::debug!("{} {} failed: {}", caller, fid.function, e);
            CallOutcome::Return(Response::error(e.into()))
        }
    };
    StepResult { outcome, commits }
}

/// Complete the parked call of `partition`.
pub fn step_resume(
    state: &mut MonitorState,
    partition: PartitionId,
    token: ResumeToken,
) -> StepResult {
    let mut commits = Vec::new();
    let response = match message::resume(state, partition, token, &mut commits) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("resume of {} with {:?} failed: {}", partition, token, e);
            Response::error(e.into())
        }
    };
    StepResult {
        outcome: CallOutcome::Return(response),
        commits,
    }
}

/// Cancel the parked call of `partition`. `None` when nothing was parked.
pub fn step_interrupt<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    partition: PartitionId,
    interrupt_id: u32,
) -> Option<StepResult> {
    let mut commits = Vec::new();
    let response = message::interrupt(state, sched, partition, interrupt_id, &mut commits)?;
    Some(StepResult {
        outcome: CallOutcome::Return(response),
        commits,
    })
}

#[allow(clippy::too_many_arguments)]
fn dispatch<S: Scheduler, M: MemoryMapper>(
    state: &mut MonitorState,
    sched: &mut S,
    mapper: &mut M,
    caller: PartitionId,
    fid: FunctionId,
    call: SpciCall,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, StepError> {
    if !state.is_registered(caller) {
        return Err(StepError::UnknownCaller(caller));
    }
    if !matches!(call, SpciCall::Version { .. }) && state.negotiated(caller).is_none() {
        return Err(StepError::NotNegotiated(caller));
    }
    if call.needs_mailbox() && !state.mailboxes.is_mapped(caller) {
        return Err(StepError::NoMailbox(caller));
    }

    let outcome: CallOutcome = match call {
        SpciCall::Error | SpciCall::Success | SpciCall::Interrupt => {
            return Err(StepError::ResponseCode(call.function()))
        }
        SpciCall::Version { requested } => version(state, caller, requested, commits)?.into(),
        SpciCall::Features { function_id } => features(function_id)?.into(),
        SpciCall::RxRelease => message::release_rx(state, sched, caller, commits)?.into(),
        SpciCall::RxTxMap {
            tx_addr,
            rx_addr,
            page_count,
        } => rxtx_map(state, caller, tx_addr, rx_addr, page_count, commits)?.into(),
        SpciCall::RxTxUnmap { id } => rxtx_unmap(state, caller, id, commits)?.into(),
        SpciCall::PartitionInfoGet { uuid } => {
            partition_info_get(state, caller, &uuid, commits)?.into()
        }
        SpciCall::IdGet => {
            Response::success_with(CallWidth::Smc32, [caller.0 as u64, 0, 0, 0]).into()
        }
        SpciCall::MsgPoll => message::poll(state, caller, commits)?,
        SpciCall::MsgWait => message::wait(state, sched, caller, commits)?,
        SpciCall::MsgYield => message::yield_now(state, sched, caller, commits)?,
        SpciCall::MsgRun { target } => message::run(state, sched, caller, target, commits)?,
        SpciCall::MsgSend {
            source,
            destination,
            length,
            attributes,
        } => message::send(
            state,
            sched,
            caller,
            source,
            destination,
            length,
            attributes,
            commits,
        )?,
        SpciCall::MsgSendDirectReq {
            source,
            destination,
            payload,
        } => message::direct_request(
            state,
            sched,
            caller,
            fid.response(Function::MsgSendDirectReq).width,
            source,
            destination,
            payload,
            commits,
        )?,
        SpciCall::MsgSendDirectResp {
            source,
            destination,
            payload,
        } => message::direct_response(
            state,
            sched,
            caller,
            fid.response(Function::MsgSendDirectResp).width,
            source,
            destination,
            payload,
            commits,
        )?,
        SpciCall::MemTransfer {
            kind,
            total_length,
            fragment_length,
        } => {
            let handle = memory::transfer(
                state,
                mapper,
                caller,
                kind,
                total_length,
                fragment_length,
                commits,
            )?;
            Response::success_with(
                fid.response(Function::Success).width,
                [handle.lo() as u64, handle.hi() as u64, 0, 0],
            )
            .into()
        }
        SpciCall::MemRetrieveReq { handle, access } => {
            let access = memory::retrieve_request(state, caller, handle, access, commits)?;
            Response::Call {
                fid: fid.response(Function::MemRetrieveResp),
                args: [
                    0,
                    handle.lo() as u64,
                    handle.hi() as u64,
                    access.bits() as u64,
                    0,
                    0,
                    0,
                ],
            }
            .into()
        }
        SpciCall::MemRetrieveResp { handle } => {
            memory::retrieve_response(state, mapper, caller, handle, commits)?;
            Response::success().into()
        }
        SpciCall::MemRelinquish { handle } => {
            memory::relinquish(state, mapper, caller, handle, commits)?;
            Response::success().into()
        }
        SpciCall::MemReclaim { handle } => {
            memory::reclaim(state, mapper, caller, handle, commits)?;
            Response::success().into()
        }
    };
    Ok(outcome)
}

// ============================================================================
// Local handlers
// ============================================================================

/// `VERSION`: negotiate when the majors match.
///
/// A failed request never clears an earlier negotiation.
fn version(
    state: &mut MonitorState,
    caller: PartitionId,
    word: u32,
    commits: &mut Vec<CommitType>,
) -> Result<Response, StepError> {
    let requested = Version::from_word(word).map_err(|_| StepError::IncompatibleVersion(word))?;
    if !state.version.is_compatible_with(requested) {
        log::info!(
            "{} asked for version {}, monitor implements {}",
            caller,
            requested,
            state.version
        );
        return Err(StepError::IncompatibleVersion(word));
    }

    let monitor_version = state.version;
    // Never above what the monitor implements, never below an earlier agreement
    let agreed = requested.min(monitor_version);
    if let Some(p) = state.partition_mut(caller) {
        if p.version.map_or(true, |current| agreed > current) {
            p.version = Some(agreed);
            commits.push(CommitType::VersionNegotiated {
                partition: caller,
                version: agreed,
            });
        }
    }
    Ok(Response::Version(monitor_version))
}

/// `FEATURES`: is `function_id` something the dispatcher handles?
fn features(function_id: u32) -> Result<Response, StepError> {
    match FunctionId::decode(function_id) {
        Ok(fid) if !fid.function.is_response_code() => Ok(Response::success()),
        _ => Err(StepError::NotImplemented(function_id)),
    }
}

/// `RXTX_MAP`: bind buffers the caller owns.
fn rxtx_map(
    state: &mut MonitorState,
    caller: PartitionId,
    tx_addr: u64,
    rx_addr: u64,
    page_count: u32,
    commits: &mut Vec<CommitType>,
) -> Result<Response, StepError> {
    state
        .mailboxes
        .check_map(caller, rx_addr, tx_addr, page_count)?;
    for addr in [rx_addr, tx_addr] {
        if !state.memory.owns(caller, &PageRange::new(addr, page_count)) {
            return Err(StepError::BufferNotOwned(addr));
        }
    }

    state.mailboxes.map(caller, rx_addr, tx_addr, page_count)?;
    log::info!(
        "{} mapped RX {:#x} TX {:#x} ({} pages)",
        caller,
        rx_addr,
        tx_addr,
        page_count
    );
    commits.push(CommitType::MailboxMapped {
        partition: caller,
        rx_addr,
        tx_addr,
        page_count,
    });
    Ok(Response::success())
}

/// `RXTX_UNMAP`: release the caller's buffers. `id` is the caller or zero.
fn rxtx_unmap(
    state: &mut MonitorState,
    caller: PartitionId,
    id: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<Response, StepError> {
    if id != caller && id != PartitionId::MONITOR {
        return Err(StepError::ForeignMailbox(id));
    }
    state.mailboxes.unmap(caller)?;
    log::info!("{} unmapped its mailbox", caller);
    commits.push(CommitType::MailboxUnmapped { partition: caller });
    Ok(Response::success())
}

/// `PARTITION_INFO_GET`: write matching partition descriptors to RX.
fn partition_info_get(
    state: &mut MonitorState,
    caller: PartitionId,
    uuid: &Uuid,
    commits: &mut Vec<CommitType>,
) -> Result<Response, StepError> {
    let infos = state.partition_infos(uuid);
    if infos.is_empty() {
        return Err(StepError::NoMatchingPartition(*uuid));
    }
    let mut bytes = Vec::with_capacity(infos.len() * PartitionInfo::SIZE);
    for info in &infos {
        info.encode_into(&mut bytes);
    }

    let mailbox = state.mailboxes.require(caller)?;
    if bytes.len() > mailbox.capacity() {
        return Err(StepError::InfoTooLarge {
            len: bytes.len(),
            capacity: mailbox.capacity(),
        });
    }
    let count = infos.len() as u32;
    state
        .mailboxes
        .stage_rx(caller, RxPayload::PartitionInfo { count, bytes })?;
    commits.push(CommitType::PartitionInfoStaged {
        partition: caller,
        count,
    });
    Ok(Response::success_with(
        CallWidth::Smc32,
        [count as u64, 0, 0, 0],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{MemoryRegionDescriptor, ReceiverAccess};
    use crate::state::Limits;
    use crate::testing::{mailbox_base, three_partitions, RecordingMapper, TestScheduler, A, B, C};
    use alloc::vec;
    use spci_abi::spci_fid;

    const D: PartitionId = PartitionId(4);

    struct Harness {
        state: MonitorState,
        sched: TestScheduler,
        mapper: RecordingMapper,
    }

    impl Harness {
        /// A, B and C negotiated with mailboxes; D registered and idle.
        fn new() -> Self {
            let mut state = three_partitions(Limits::default());
            for id in [A, B, C] {
                state.partition_mut(id).unwrap().version = Some(Version::COMPILED);
            }
            state.register_partition(D, Uuid::from_u128(0xD), 2, 0x3).unwrap();
            state
                .add_memory(D, PageRange::new(mailbox_base(D), 2), MemAccess::RW)
                .unwrap();
            Self {
                state,
                sched: TestScheduler::default(),
                mapper: RecordingMapper::default(),
            }
        }

        fn call(&mut self, caller: PartitionId, call: SpciCall, width: CallWidth) -> StepResult {
            let regs = call.to_registers(width);
            let (fid, call) = SpciCall::decode(&regs).unwrap();
            step(
                &mut self.state,
                &mut self.sched,
                &mut self.mapper,
                caller,
                fid,
                call,
            )
        }

        fn call32(&mut self, caller: PartitionId, call: SpciCall) -> CallOutcome {
            self.call(caller, call, CallWidth::Smc32).outcome
        }
    }

    fn error(code: SpciError) -> CallOutcome {
        CallOutcome::Return(Response::error(code))
    }

    // ========================================================================
    // Preconditions
    // ========================================================================

    #[test]
    fn test_unknown_caller() {
        let mut h = Harness::new();
        assert_eq!(
            h.call32(PartitionId(99), SpciCall::IdGet),
            error(SpciError::InvalidParameter)
        );
    }

    #[test]
    fn test_calls_before_version_denied() {
        let mut h = Harness::new();
        assert_eq!(h.call32(D, SpciCall::IdGet), error(SpciError::Denied));

        let result = h.call(
            D,
            SpciCall::Version {
                requested: Version::new(0, 1).to_word(),
            },
            CallWidth::Smc32,
        );
        assert_eq!(
            result.outcome,
            CallOutcome::Return(Response::Version(Version::COMPILED))
        );
        assert!(matches!(
            result.commits[0],
            CommitType::VersionNegotiated { partition: D, .. }
        ));
        assert!(h.call32(D, SpciCall::IdGet).response().unwrap().is_success());
    }

    #[test]
    fn test_version_idempotent() {
        let mut h = Harness::new();
        let request = SpciCall::Version {
            requested: Version::COMPILED.to_word(),
        };
        let first = h.call(D, request, CallWidth::Smc32);
        let second = h.call(D, request, CallWidth::Smc32);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.commits.len(), 1);
        assert!(second.commits.is_empty());
    }

    #[test]
    fn test_version_never_lowered() {
        let mut h = Harness::new();
        let result = h.call(
            A,
            SpciCall::Version {
                requested: Version::new(0, 1).to_word(),
            },
            CallWidth::Smc32,
        );
        assert_eq!(
            result.outcome,
            CallOutcome::Return(Response::Version(Version::COMPILED))
        );
        assert!(result.commits.is_empty());
        assert_eq!(h.state.negotiated(A), Some(Version::COMPILED));
    }

    #[test]
    fn test_version_capped_at_monitor_minor() {
        let mut h = Harness::new();
        let result = h.call(
            D,
            SpciCall::Version {
                requested: Version::new(0, 500).to_word(),
            },
            CallWidth::Smc32,
        );
        assert_eq!(
            result.commits,
            vec![CommitType::VersionNegotiated {
                partition: D,
                version: Version::COMPILED
            }]
        );
        assert_eq!(h.state.negotiated(D), Some(Version::COMPILED));
    }

    #[test]
    fn test_incompatible_version_keeps_negotiation() {
        let mut h = Harness::new();
        assert_eq!(
            h.call32(
                A,
                SpciCall::Version {
                    requested: Version::new(1, 0).to_word()
                }
            ),
            error(SpciError::NotSupported)
        );
        assert_eq!(
            h.call32(A, SpciCall::Version { requested: 1 << 31 }),
            error(SpciError::NotSupported)
        );
        assert_eq!(h.state.negotiated(A), Some(Version::COMPILED));
    }

    #[test]
    fn test_response_codes_not_callable() {
        let mut h = Harness::new();
        for call in [SpciCall::Error, SpciCall::Success, SpciCall::Interrupt] {
            assert_eq!(h.call32(A, call), error(SpciError::NotSupported));
        }
    }

    #[test]
    fn test_mailbox_calls_need_mailbox() {
        let mut h = Harness::new();
        h.state.partition_mut(D).unwrap().version = Some(Version::COMPILED);
        assert_eq!(h.call32(D, SpciCall::MsgPoll), error(SpciError::Denied));
        assert_eq!(h.call32(D, SpciCall::RxRelease), error(SpciError::Denied));

        // Waiting works without a mailbox
        assert!(matches!(
            h.call32(D, SpciCall::MsgWait),
            CallOutcome::Suspended(_)
        ));
    }

    // ========================================================================
    // Local handlers
    // ========================================================================

    #[test]
    fn test_features() {
        let mut h = Harness::new();
        let supported = spci_fid(CallWidth::Smc64, Function::MemLend);
        assert!(h
            .call32(A, SpciCall::Features { function_id: supported })
            .response()
            .unwrap()
            .is_success());
        for function_id in [
            spci_fid(CallWidth::Smc32, Function::Error),
            0x8400_0078,
            0x1234,
        ] {
            assert_eq!(
                h.call32(A, SpciCall::Features { function_id }),
                error(SpciError::NotSupported)
            );
        }
    }

    #[test]
    fn test_id_get() {
        let mut h = Harness::new();
        let regs = h
            .call32(C, SpciCall::IdGet)
            .response()
            .unwrap()
            .into_registers();
        assert_eq!(regs.w(2), 3);
    }

    #[test]
    fn test_rxtx_map_requires_owned_buffers() {
        let mut h = Harness::new();
        h.state.partition_mut(D).unwrap().version = Some(Version::COMPILED);
        let base = mailbox_base(D);

        // TX in A's memory
        assert_eq!(
            h.call32(
                D,
                SpciCall::RxTxMap {
                    tx_addr: mailbox_base(A),
                    rx_addr: base,
                    page_count: 1
                }
            ),
            error(SpciError::InvalidParameter)
        );
        assert!(!h.state.mailboxes.is_mapped(D));

        let result = h.call(
            D,
            SpciCall::RxTxMap {
                tx_addr: base + 0x1000,
                rx_addr: base,
                page_count: 1,
            },
            CallWidth::Smc64,
        );
        assert!(result.outcome.response().unwrap().is_success());
        assert!(h.state.mailboxes.is_mapped(D));

        assert_eq!(
            h.call32(
                D,
                SpciCall::RxTxMap {
                    tx_addr: base + 0x1000,
                    rx_addr: base,
                    page_count: 1
                }
            ),
            error(SpciError::Denied)
        );
    }

    #[test]
    fn test_rxtx_unmap() {
        let mut h = Harness::new();
        assert_eq!(
            h.call32(A, SpciCall::RxTxUnmap { id: B }),
            error(SpciError::InvalidParameter)
        );
        assert!(h
            .call32(A, SpciCall::RxTxUnmap { id: A })
            .response()
            .unwrap()
            .is_success());
        assert_eq!(
            h.call32(A, SpciCall::RxTxUnmap { id: PartitionId::MONITOR }),
            error(SpciError::Denied)
        );
    }

    #[test]
    fn test_partition_info_get() {
        let mut h = Harness::new();
        let outcome = h.call32(
            A,
            SpciCall::PartitionInfoGet {
                uuid: Uuid::from_u128(0xD),
            },
        );
        assert_eq!(outcome.response().unwrap().into_registers().w(2), 1);
        match h.state.mailboxes.get(A).unwrap().rx() {
            Some(RxPayload::PartitionInfo { count, bytes }) => {
                assert_eq!(*count, 1);
                assert_eq!(bytes.as_slice(), &[0x04, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00]);
            }
            other => panic!("Expected partition info, got {:?}", other),
        }

        // RX still holds the first answer
        assert_eq!(
            h.call32(A, SpciCall::PartitionInfoGet { uuid: Uuid::nil() }),
            error(SpciError::Busy)
        );
        assert_eq!(
            h.call32(
                B,
                SpciCall::PartitionInfoGet {
                    uuid: Uuid::from_u128(0xEEEE)
                }
            ),
            error(SpciError::InvalidParameter)
        );
    }

    // ========================================================================
    // Routing
    // ========================================================================

    fn lend_descriptor() -> Vec<u8> {
        MemoryRegionDescriptor {
            sender: A,
            receivers: vec![ReceiverAccess {
                id: B,
                access: MemAccess::RW,
            }],
            ranges: vec![PageRange::new(mailbox_base(A) + 0x2000, 1)],
        }
        .encode()
    }

    #[test]
    fn test_lend_returns_handle_at_request_width() {
        let mut h = Harness::new();
        h.state
            .add_memory(A, PageRange::new(mailbox_base(A) + 0x2000, 1), MemAccess::RW)
            .unwrap();
        let bytes = lend_descriptor();
        let len = bytes.len() as u32;
        h.state.mailboxes.stage_tx(A, bytes).unwrap();

        let result = h.call(
            A,
            SpciCall::MemTransfer {
                kind: TransactionKind::Lend,
                total_length: len,
                fragment_length: len,
            },
            CallWidth::Smc64,
        );
        let regs = result.outcome.response().unwrap().into_registers();
        assert_eq!(regs.fid(), spci_fid(CallWidth::Smc64, Function::Success));
        assert_eq!(regs.w(2), 1);
        assert_eq!(regs.w(3), 0);
        assert!(matches!(
            result.commits[0],
            CommitType::TransactionCreated { .. }
        ));

        let outcome = h.call32(
            B,
            SpciCall::MemRetrieveReq {
                handle: Handle(1),
                access: MemAccess::READ,
            },
        );
        let regs = outcome.response().unwrap().into_registers();
        assert_eq!(regs.fid(), spci_fid(CallWidth::Smc32, Function::MemRetrieveResp));
        assert_eq!(regs.w(2), 1);
        assert_eq!(regs.w(4), MemAccess::READ.bits() as u32);

        assert!(h
            .call32(B, SpciCall::MemRetrieveResp { handle: Handle(1) })
            .response()
            .unwrap()
            .is_success());
        assert_eq!(
            h.call32(A, SpciCall::MemReclaim { handle: Handle(2) }),
            error(SpciError::InvalidParameter)
        );
    }

    #[test]
    fn test_failed_call_has_no_commits() {
        let mut h = Harness::new();
        let result = h.call(
            A,
            SpciCall::MemRetrieveResp { handle: Handle(5) },
            CallWidth::Smc32,
        );
        assert_eq!(result.outcome, error(SpciError::InvalidParameter));
        assert!(result.commits.is_empty());
    }

    #[test]
    fn test_resume_and_interrupt_entry_points() {
        let mut h = Harness::new();
        let token = match h.call32(A, SpciCall::MsgYield) {
            CallOutcome::Suspended(token) => token,
            other => panic!("Expected Suspended, got {:?}", other),
        };
        assert_eq!(
            step_resume(&mut h.state, A, spci_hal::ResumeToken(token.0 + 7)).outcome,
            error(SpciError::InvalidParameter)
        );
        let result = step_resume(&mut h.state, A, token);
        assert_eq!(result.outcome, CallOutcome::Return(Response::success()));

        assert!(step_interrupt(&mut h.state, &mut h.sched, A, 3).is_none());
        h.call32(A, SpciCall::MsgWait);
        let result = step_interrupt(&mut h.state, &mut h.sched, A, 3).unwrap();
        assert_eq!(
            result.outcome,
            CallOutcome::Return(Response::Error {
                code: SpciError::Interrupted,
                detail: 3
            })
        );
    }
}
