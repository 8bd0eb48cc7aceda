//! Indirect and direct messaging through the monitor gateway

mod common;

use common::*;
use spci_abi::{
    CallWidth, Function, FunctionId, PartitionId, Response, SendAttributes, SpciError,
};
use spci_core::{CallOutcome, ExecState, SpciCall};
use spci_hal::{InterruptId, ResumeToken};

fn delivered(response: &Response) -> (PartitionId, PartitionId, u64) {
    match response {
        Response::Call { fid, args } => {
            assert_eq!(*fid, FunctionId::smc32(Function::MsgSend));
            let (source, destination) = PartitionId::unpack_pair(args[0] as u32);
            (source, destination, args[2])
        }
        other => panic!("Expected MSG_SEND, got {:?}", other),
    }
}

fn suspended(outcome: CallOutcome) -> ResumeToken {
    match outcome {
        CallOutcome::Suspended(token) => token,
        other => panic!("Expected Suspended, got {:?}", other),
    }
}

// ============================================================================
// Indirect messages
// ============================================================================

#[test]
fn test_send_poll_release_send_again() {
    let mut monitor = monitor();
    let payload = [0xA5u8; 64];

    let sent = send(&mut monitor, B, A, &payload, SendAttributes::NON_BLOCKING);
    assert_eq!(sent, CallOutcome::Return(Response::success()));
    assert_eq!(monitor.read_rx(A), Some(&payload[..]));

    let polled = call(&mut monitor, A, SpciCall::MsgPoll);
    assert_eq!(delivered(&polled), (B, A, 64));

    assert_success(call(&mut monitor, A, SpciCall::RxRelease));
    assert_eq!(monitor.read_rx(A), None);

    let again = send(&mut monitor, B, A, &[1, 2, 3], SendAttributes::NON_BLOCKING);
    assert_eq!(again, CallOutcome::Return(Response::success()));
    assert_consistent(&monitor);
}

#[test]
fn test_second_send_before_release_is_busy() {
    let mut monitor = monitor();
    let first = [0x11u8; 64];

    send(&mut monitor, B, A, &first, SendAttributes::NON_BLOCKING);
    let second = send(&mut monitor, C, A, &[0x22; 16], SendAttributes::NON_BLOCKING);
    assert_eq!(second.error_code(), Some(SpciError::Busy));

    // The first message is untouched and still deliverable
    assert_eq!(monitor.read_rx(A), Some(&first[..]));
    let polled = call(&mut monitor, A, SpciCall::MsgPoll);
    assert_eq!(delivered(&polled), (B, A, 64));
    assert_consistent(&monitor);
}

#[test]
fn test_poll_with_nothing_staged_is_retry() {
    let mut monitor = monitor();
    let response = call(&mut monitor, A, SpciCall::MsgPoll);
    assert_eq!(response.error_code(), Some(SpciError::Retry));
}

#[test]
fn test_send_requires_mailbox() {
    let mut monitor = fresh_monitor();
    call(&mut monitor, A, SpciCall::Version {
        requested: spci_abi::Version::COMPILED.to_word(),
    });
    let response = call(&mut monitor, A, SpciCall::MsgSend {
        source: A,
        destination: B,
        length: 4,
        attributes: SendAttributes::NON_BLOCKING,
    });
    assert_eq!(response.error_code(), Some(SpciError::Denied));
}

#[test]
fn test_send_to_self_is_invalid() {
    let mut monitor = monitor();
    let outcome = send(&mut monitor, A, A, &[1], SendAttributes::NON_BLOCKING);
    assert_eq!(outcome.error_code(), Some(SpciError::InvalidParameter));
}

#[test]
fn test_blocking_send_parks_until_release() {
    let mut monitor = monitor();

    let token = suspended(send(&mut monitor, B, A, &[7; 8], SendAttributes::BLOCKING));
    assert!(!monitor.scheduler().was_woken(B, token));

    call(&mut monitor, A, SpciCall::MsgPoll);
    assert_success(call(&mut monitor, A, SpciCall::RxRelease));
    assert!(monitor.scheduler().was_woken(B, token));

    let resumed = monitor.resume(B, token);
    assert_eq!(resumed, CallOutcome::Return(Response::success()));
    assert_eq!(monitor.state().partition(B).unwrap().exec, ExecState::Running);
    assert_consistent(&monitor);
}

// ============================================================================
// Wait, yield, run
// ============================================================================

#[test]
fn test_wait_parks_and_send_wakes() {
    let mut monitor = monitor();

    let token = suspended(outcome(&mut monitor, A, SpciCall::MsgWait));
    assert!(!monitor.scheduler().was_woken(A, token));

    send(&mut monitor, B, A, &[9; 32], SendAttributes::NON_BLOCKING);
    assert!(monitor.scheduler().was_woken(A, token));

    match monitor.resume(A, token) {
        CallOutcome::Return(response) => assert_eq!(delivered(&response), (B, A, 32)),
        other => panic!("Expected Return, got {:?}", other),
    }
    assert_consistent(&monitor);
}

#[test]
fn test_wait_delivers_immediately_when_staged() {
    let mut monitor = monitor();
    send(&mut monitor, C, A, &[3; 12], SendAttributes::NON_BLOCKING);

    let response = call(&mut monitor, A, SpciCall::MsgWait);
    assert_eq!(delivered(&response), (C, A, 12));
}

#[test]
fn test_wait_reports_pending_interrupt() {
    let mut monitor = monitor();
    monitor.scheduler_mut().raise(A, 27);

    let response = call(&mut monitor, A, SpciCall::MsgWait);
    assert_eq!(
        response,
        Response::Interrupt {
            target: A,
            interrupt_id: 27
        }
    );
}

#[test]
fn test_interrupt_cancels_wait() {
    let mut monitor = monitor();
    suspended(outcome(&mut monitor, A, SpciCall::MsgWait));

    let cancelled = monitor.interrupt(A, InterruptId(40)).unwrap();
    assert_eq!(
        cancelled,
        CallOutcome::Return(Response::Error {
            code: SpciError::Interrupted,
            detail: 40
        })
    );
    assert_eq!(monitor.state().partition(A).unwrap().exec, ExecState::Running);

    // Nothing left to cancel
    assert!(monitor.interrupt(A, InterruptId(41)).is_none());
}

#[test]
fn test_yield_is_ready_at_once() {
    let mut monitor = monitor();
    let token = suspended(outcome(&mut monitor, A, SpciCall::MsgYield));
    assert!(monitor.scheduler().was_woken(A, token));
    assert_eq!(
        monitor.resume(A, token),
        CallOutcome::Return(Response::success())
    );
}

#[test]
fn test_resume_with_stale_token_fails() {
    let mut monitor = monitor();
    let token = suspended(outcome(&mut monitor, A, SpciCall::MsgYield));
    let stale = ResumeToken(token.0 + 100);
    assert_eq!(
        monitor.resume(A, stale).error_code(),
        Some(SpciError::InvalidParameter)
    );
}

#[test]
fn test_run_hands_off_to_ready_partition() {
    let mut monitor = monitor();
    suspended(outcome(&mut monitor, A, SpciCall::MsgWait));

    // Not ready yet
    let early = outcome(&mut monitor, B, SpciCall::MsgRun { target: A });
    assert_eq!(early.error_code(), Some(SpciError::Busy));

    send(&mut monitor, B, A, &[5; 4], SendAttributes::NON_BLOCKING);
    match outcome(&mut monitor, B, SpciCall::MsgRun { target: A }) {
        CallOutcome::Handoff { target, response } => {
            assert_eq!(target, A);
            assert_eq!(delivered(&response), (B, A, 4));
        }
        other => panic!("Expected Handoff, got {:?}", other),
    }
    assert!(!monitor.scheduler().woken.iter().any(|(p, _)| *p == A));
    assert_consistent(&monitor);
}

// ============================================================================
// Direct messages
// ============================================================================

#[test]
fn test_direct_request_and_response() {
    let mut monitor = monitor();
    suspended(outcome(&mut monitor, A, SpciCall::MsgWait));

    let request = outcome(&mut monitor, B, SpciCall::MsgSendDirectReq {
        source: B,
        destination: A,
        payload: [1, 2, 3, 4, 5],
    });
    match request {
        CallOutcome::Handoff { target, response } => {
            assert_eq!(target, A);
            match response {
                Response::Call { fid, args } => {
                    assert_eq!(fid, FunctionId::smc32(Function::MsgSendDirectReq));
                    assert_eq!(args[0] as u32, PartitionId::pack_pair(B, A));
                    assert_eq!(&args[2..], &[1, 2, 3, 4, 5]);
                }
                other => panic!("Expected direct request, got {:?}", other),
            }
        }
        other => panic!("Expected Handoff, got {:?}", other),
    }
    assert_eq!(
        monitor.state().partition(B).unwrap().exec,
        ExecState::AwaitingDirectResponse { responder: A }
    );
    assert_consistent(&monitor);

    let reply = outcome(&mut monitor, A, SpciCall::MsgSendDirectResp {
        source: A,
        destination: B,
        payload: [9, 8, 7, 6, 5],
    });
    match reply {
        CallOutcome::Handoff { target, response } => {
            assert_eq!(target, B);
            assert!(matches!(
                response,
                Response::Call { fid, .. } if fid.function == Function::MsgSendDirectResp
            ));
        }
        other => panic!("Expected Handoff, got {:?}", other),
    }
    assert_eq!(monitor.state().partition(B).unwrap().exec, ExecState::Running);
    assert!(monitor.state().partition(A).unwrap().is_waiting());
    assert_consistent(&monitor);
}

#[test]
fn test_direct_request_withdraws_woken_wait() {
    let mut monitor = monitor();
    let waiting = suspended(outcome(&mut monitor, A, SpciCall::MsgWait));
    send(&mut monitor, C, A, &[4; 16], SendAttributes::NON_BLOCKING);
    assert!(monitor.scheduler().was_woken(A, waiting));

    let request = outcome(&mut monitor, B, SpciCall::MsgSendDirectReq {
        source: B,
        destination: A,
        payload: [0; 5],
    });
    assert!(matches!(request, CallOutcome::Handoff { target: A, .. }));
    // A is serving B; the scheduler must not resume the old wait
    assert!(monitor.scheduler().was_cancelled(A, waiting));
    assert!(!monitor.scheduler().was_woken(A, waiting));
    assert_eq!(monitor.state().partition(A).unwrap().exec, ExecState::Running);

    // Answering parks A again, ready because C's message is still unread
    let reply = outcome(&mut monitor, A, SpciCall::MsgSendDirectResp {
        source: A,
        destination: B,
        payload: [0; 5],
    });
    assert!(matches!(reply, CallOutcome::Handoff { target: B, .. }));
    let (_, next) = *monitor.scheduler().parked.last().unwrap();
    assert_ne!(next, waiting);
    assert!(monitor.scheduler().was_woken(A, next));

    match monitor.resume(A, next) {
        CallOutcome::Return(response) => assert_eq!(delivered(&response), (C, A, 16)),
        other => panic!("Expected Return, got {:?}", other),
    }
    assert_consistent(&monitor);
}

#[test]
fn test_interrupt_withdraws_token() {
    let mut monitor = monitor();
    let token = suspended(outcome(&mut monitor, A, SpciCall::MsgYield));
    assert!(monitor.scheduler().was_woken(A, token));

    monitor.interrupt(A, InterruptId(12)).unwrap();
    assert!(monitor.scheduler().was_cancelled(A, token));
    assert!(!monitor.scheduler().was_woken(A, token));
}

#[test]
fn test_direct_request_to_busy_partition() {
    let mut monitor = monitor();
    let response = outcome(&mut monitor, B, SpciCall::MsgSendDirectReq {
        source: B,
        destination: A,
        payload: [0; 5],
    });
    assert_eq!(response.error_code(), Some(SpciError::Busy));
}

#[test]
fn test_direct_request_keeps_smc64_width() {
    let mut monitor = monitor();
    suspended(outcome(&mut monitor, A, SpciCall::MsgWait));

    let call = SpciCall::MsgSendDirectReq {
        source: B,
        destination: A,
        payload: [u64::MAX, 0, 0, 0, 1],
    };
    match monitor.handle_call(B, &call.to_registers(CallWidth::Smc64)) {
        CallOutcome::Handoff {
            response: Response::Call { fid, args },
            ..
        } => {
            assert_eq!(fid.width, CallWidth::Smc64);
            assert_eq!(args[2], u64::MAX);
        }
        other => panic!("Expected Handoff, got {:?}", other),
    }
}
