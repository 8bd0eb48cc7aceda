//! Message engine
//!
//! Indirect messages travel through the mailboxes; direct messages and
//! `MSG_RUN` hand control straight to the peer. Calls that cannot complete
//! immediately park the caller through the [`Scheduler`] and finish in
//! [`resume`] or [`interrupt`].

use alloc::vec::Vec;

use spci_abi::{
    CallWidth, Function, FunctionId, PartitionId, Response, SendAttributes, SpciError,
};
use spci_hal::{HalError, ResumeToken, Scheduler};
use thiserror::Error;

use crate::mailbox::{MailboxError, RxPayload};
use crate::state::MonitorState;
use crate::step::CommitType;
use crate::types::{CallOutcome, ExecState, Message, ParkReason};

/// Message engine errors
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("source {0} is not the caller")]
    SourceMismatch(PartitionId),
    #[error("invalid destination {0}")]
    InvalidDestination(PartitionId),
    #[error("zero-length message")]
    EmptyMessage,
    #[error("no message to deliver")]
    NoMessage,
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("{0} is not parked")]
    NotParked(PartitionId),
    #[error("{0} has nothing to resume with yet")]
    NotReady(PartitionId),
    #[error("stale resume token for {0}")]
    StaleToken(PartitionId),
    #[error("{0} is not waiting for a direct request")]
    PeerBusy(PartitionId),
    #[error("no direct request from {0} outstanding")]
    NoDirectRequest(PartitionId),
    #[error("scheduler: {0}")]
    Scheduler(#[from] HalError),
}

impl From<MessageError> for SpciError {
    fn from(value: MessageError) -> Self {
        match value {
            MessageError::SourceMismatch(_)
            | MessageError::InvalidDestination(_)
            | MessageError::EmptyMessage
            | MessageError::NotParked(_)
            | MessageError::StaleToken(_)
            | MessageError::NoDirectRequest(_) => SpciError::InvalidParameter,
            MessageError::NoMessage => SpciError::Retry,
            MessageError::NotReady(_) | MessageError::PeerBusy(_) => SpciError::Busy,
            MessageError::Mailbox(e) => e.into(),
            MessageError::Scheduler(e) => e.into(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Destination must be another registered partition.
fn check_destination(
    state: &MonitorState,
    caller: PartitionId,
    dest: PartitionId,
) -> Result<(), MessageError> {
    if dest == caller || dest == PartitionId::MONITOR || !state.is_registered(dest) {
        return Err(MessageError::InvalidDestination(dest));
    }
    Ok(())
}

/// Registers of a delivered indirect message.
fn message_response(msg: &Message) -> Response {
    Response::Call {
        fid: FunctionId::smc32(Function::MsgSend),
        args: [
            PartitionId::pack_pair(msg.source, msg.destination) as u64,
            0,
            msg.len() as u64,
            0,
            0,
            0,
            0,
        ],
    }
}

/// Hand the unread RX message of `partition` over to it.
///
/// The sender's TX is free again once the message has been read.
fn deliver(
    state: &mut MonitorState,
    partition: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Option<Response> {
    let msg = state.mailboxes.get_mut(partition)?.read_message()?;
    if let Some(sender) = state.mailboxes.get_mut(msg.source) {
        sender.complete_delivery(partition);
    }
    log::debug!("{} read {} bytes from {}", partition, msg.len(), msg.source);
    commits.push(CommitType::MessageDelivered {
        source: msg.source,
        destination: partition,
    });
    Some(message_response(&msg))
}

/// Record `partition` as parked and wake it right away if it is ready.
fn park<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    partition: PartitionId,
    token: ResumeToken,
    reason: ParkReason,
    ready: bool,
    commits: &mut Vec<CommitType>,
) {
    if let Some(p) = state.partition_mut(partition) {
        p.exec = ExecState::Parked {
            token,
            reason,
            ready,
        };
    }
    if ready {
        sched.wake(partition, token);
    }
    commits.push(CommitType::Parked { partition, reason });
}

/// The event `partition` waits for has happened.
fn make_ready<S: Scheduler>(state: &mut MonitorState, sched: &mut S, partition: PartitionId) {
    if let Some(p) = state.partition_mut(partition) {
        if let ExecState::Parked { token, ready, .. } = &mut p.exec {
            if !*ready {
                *ready = true;
                sched.wake(partition, *token);
            }
        }
    }
}

/// `partition` leaves its suspension without the scheduler resuming it.
fn unpark<S: Scheduler>(state: &mut MonitorState, sched: &mut S, partition: PartitionId) {
    if let Some(p) = state.partition_mut(partition) {
        if let ExecState::Parked { token, .. } = p.exec {
            sched.cancel(partition, token);
        }
        p.exec = ExecState::Running;
    }
}

/// Result of a parked call once its event happened.
fn complete(
    state: &mut MonitorState,
    partition: PartitionId,
    reason: ParkReason,
    commits: &mut Vec<CommitType>,
) -> Response {
    let response = match reason {
        ParkReason::Wait => deliver(state, partition, commits)
            .unwrap_or(Response::error(SpciError::Retry)),
        ParkReason::BlockingSend { .. } | ParkReason::Yield => Response::success(),
    };
    if let Some(p) = state.partition_mut(partition) {
        p.exec = ExecState::Running;
    }
    commits.push(CommitType::Resumed { partition });
    response
}

// ============================================================================
// Indirect messaging
// ============================================================================

/// `MSG_SEND`: stage `length` bytes of the caller's TX in `dest`'s RX.
#[allow(clippy::too_many_arguments)]
pub fn send<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    source: PartitionId,
    dest: PartitionId,
    length: u32,
    attributes: SendAttributes,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    if source != caller {
        return Err(MessageError::SourceMismatch(source));
    }
    check_destination(state, caller, dest)?;
    if length == 0 {
        return Err(MessageError::EmptyMessage);
    }
    let length = length as usize;

    state.mailboxes.require(caller)?.peek_tx(length)?;
    let dest_box = state.mailboxes.require(dest)?;
    if length > dest_box.capacity() {
        return Err(MailboxError::TooLarge {
            len: length,
            capacity: dest_box.capacity(),
        }
        .into());
    }
    if !dest_box.rx_is_free() {
        return Err(MailboxError::RxBusy.into());
    }

    // Park before mutating so a scheduler failure leaves nothing behind
    let token = if attributes.blocking {
        Some(sched.park(caller)?)
    } else {
        None
    };

    let payload = state.mailboxes.require_mut(caller)?.send_tx(length, dest)?;
    state.mailboxes.stage_rx(
        dest,
        RxPayload::Message(Message {
            source: caller,
            destination: dest,
            blocking: attributes.blocking,
            payload,
        }),
    )?;
    commits.push(CommitType::MessageSent {
        source: caller,
        destination: dest,
        length: length as u32,
        blocking: attributes.blocking,
    });
    log::debug!("{} sent {} bytes to {}", caller, length, dest);

    if state.partition(dest).is_some_and(|p| p.is_waiting()) {
        make_ready(state, sched, dest);
    }

    match token {
        Some(token) => {
            park(
                state,
                sched,
                caller,
                token,
                ParkReason::BlockingSend { dest },
                false,
                commits,
            );
            Ok(CallOutcome::Suspended(token))
        }
        None => Ok(CallOutcome::Return(Response::success())),
    }
}

/// `MSG_POLL`: deliver the unread message or report `Retry`.
pub fn poll(
    state: &mut MonitorState,
    caller: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    state.mailboxes.require(caller)?;
    deliver(state, caller, commits)
        .map(CallOutcome::Return)
        .ok_or(MessageError::NoMessage)
}

/// `MSG_WAIT`: deliver, report a pending interrupt, or park until a message
/// arrives.
pub fn wait<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    if let Some(response) = deliver(state, caller, commits) {
        return Ok(CallOutcome::Return(response));
    }
    if let Some(irq) = sched.pending_interrupt(caller) {
        log::debug!("{} has interrupt {} pending", caller, irq.0);
        return Ok(CallOutcome::Return(Response::Interrupt {
            target: caller,
            interrupt_id: irq.0,
        }));
    }
    let token = sched.park(caller)?;
    park(state, sched, caller, token, ParkReason::Wait, false, commits);
    Ok(CallOutcome::Suspended(token))
}

/// `MSG_YIELD`: give up the CPU; the caller is runnable straight away.
pub fn yield_now<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    let token = sched.park(caller)?;
    park(state, sched, caller, token, ParkReason::Yield, true, commits);
    Ok(CallOutcome::Suspended(token))
}

/// `RX_RELEASE`: the caller is done with its RX buffer.
///
/// A sender blocked on the released message becomes runnable.
pub fn release_rx<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<Response, MessageError> {
    let payload = state.mailboxes.release_rx(caller)?;
    commits.push(CommitType::RxReleased { partition: caller });

    if let RxPayload::Message(msg) = payload {
        if let Some(sender) = state.mailboxes.get_mut(msg.source) {
            sender.complete_delivery(caller);
        }
        let blocked = state.partition(msg.source).is_some_and(|p| {
            matches!(
                p.parked(),
                Some((_, ParkReason::BlockingSend { dest }, false)) if dest == caller
            )
        });
        if blocked {
            make_ready(state, sched, msg.source);
        }
    }
    Ok(Response::success())
}

// ============================================================================
// Run, resume, interrupt
// ============================================================================

/// `MSG_RUN`: hand the CPU to a parked partition whose event has happened.
pub fn run<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    target: PartitionId,
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    check_destination(state, caller, target)?;
    let (token, reason) = match state.partition(target).and_then(|p| p.parked()) {
        None => return Err(MessageError::NotParked(target)),
        Some((_, _, false)) => return Err(MessageError::NotReady(target)),
        Some((token, reason, true)) => (token, reason),
    };
    // The call completes here, not through the woken token
    sched.cancel(target, token);
    let response = complete(state, target, reason, commits);
    Ok(CallOutcome::Handoff { target, response })
}

/// The scheduler resumes `partition` with `token`.
pub fn resume(
    state: &mut MonitorState,
    partition: PartitionId,
    token: ResumeToken,
    commits: &mut Vec<CommitType>,
) -> Result<Response, MessageError> {
    let reason = match state.partition(partition).and_then(|p| p.parked()) {
        Some((t, _, _)) if t != token => return Err(MessageError::StaleToken(partition)),
        None => return Err(MessageError::StaleToken(partition)),
        Some((_, _, false)) => return Err(MessageError::NotReady(partition)),
        Some((_, reason, true)) => reason,
    };
    Ok(complete(state, partition, reason, commits))
}

/// Cancel the parked call of `partition` because of an interrupt.
///
/// Returns the response of the cancelled call, or `None` when nothing was
/// parked.
pub fn interrupt<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    partition: PartitionId,
    interrupt_id: u32,
    commits: &mut Vec<CommitType>,
) -> Option<Response> {
    state.partition(partition)?.parked()?;
    unpark(state, sched, partition);
    log::debug!("{} interrupted by {}", partition, interrupt_id);
    commits.push(CommitType::Interrupted {
        partition,
        interrupt_id,
    });
    Some(Response::Error {
        code: SpciError::Interrupted,
        detail: interrupt_id,
    })
}

// ============================================================================
// Direct messaging
// ============================================================================

/// Registers of a direct request or response.
fn direct_args(source: PartitionId, dest: PartitionId, payload: [u64; 5]) -> [u64; 7] {
    let mut args = [0u64; 7];
    args[0] = PartitionId::pack_pair(source, dest) as u64;
    args[2..].copy_from_slice(&payload);
    args
}

/// `MSG_SEND_DIRECT_REQ`: synchronous request to a partition waiting in
/// `MSG_WAIT`.
#[allow(clippy::too_many_arguments)]
pub fn direct_request<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    width: CallWidth,
    source: PartitionId,
    dest: PartitionId,
    payload: [u64; 5],
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    if source != caller {
        return Err(MessageError::SourceMismatch(source));
    }
    check_destination(state, caller, dest)?;
    let waiting = state.partition(dest).is_some_and(|p| p.is_waiting());
    if !waiting || state.direct_requests.contains_key(&dest) {
        return Err(MessageError::PeerBusy(dest));
    }

    state.direct_requests.insert(dest, caller);
    if let Some(p) = state.partition_mut(caller) {
        p.exec = ExecState::AwaitingDirectResponse { responder: dest };
    }
    unpark(state, sched, dest);
    commits.push(CommitType::DirectRequest {
        source: caller,
        destination: dest,
    });

    let fid = FunctionId::new(Function::MsgSendDirectReq, width);
    Ok(CallOutcome::Handoff {
        target: dest,
        response: Response::Call {
            fid,
            args: direct_args(caller, dest, payload),
        },
    })
}

/// `MSG_SEND_DIRECT_RESP`: answer the outstanding request from `dest`.
///
/// The responder goes back to waiting for the next request.
#[allow(clippy::too_many_arguments)]
pub fn direct_response<S: Scheduler>(
    state: &mut MonitorState,
    sched: &mut S,
    caller: PartitionId,
    width: CallWidth,
    source: PartitionId,
    dest: PartitionId,
    payload: [u64; 5],
    commits: &mut Vec<CommitType>,
) -> Result<CallOutcome, MessageError> {
    if source != caller {
        return Err(MessageError::SourceMismatch(source));
    }
    if state.direct_requests.get(&caller) != Some(&dest) {
        return Err(MessageError::NoDirectRequest(dest));
    }

    let token = sched.park(caller)?;
    state.direct_requests.remove(&caller);
    if let Some(p) = state.partition_mut(dest) {
        p.exec = ExecState::Running;
    }
    commits.push(CommitType::DirectResponse {
        source: caller,
        destination: dest,
    });
    let ready = state
        .mailboxes
        .get(caller)
        .is_some_and(|m| m.has_unread_message());
    park(state, sched, caller, token, ParkReason::Wait, ready, commits);

    let fid = FunctionId::new(Function::MsgSendDirectResp, width);
    Ok(CallOutcome::Handoff {
        target: dest,
        response: Response::Call {
            fid,
            args: direct_args(caller, dest, payload),
        },
    })
}
