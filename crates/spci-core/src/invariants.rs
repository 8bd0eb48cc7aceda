//! Runtime-checkable monitor invariants
//!
//! Used by the monitor after every step when checking is enabled, and by
//! the property tests.
//!
//! # Invariants
//!
//! 1. **Page/Transaction Consistency**: A page is part of a transaction
//!    exactly when that live transaction lists it
//! 2. **Transaction Receivers**: Receivers are registered, distinct from
//!    the sender, and a donation or lend has exactly one
//! 3. **Sender Access**: While a region is out, its owner holds no more
//!    than the transaction allows
//! 4. **Mailbox Consistency**: A message in RX and the sender's in-flight
//!    TX agree
//! 5. **Direct Request Pairing**: Every outstanding direct request has a
//!    requester waiting for exactly that responder
//! 6. **Handle Monotonicity**: Every handle is below the next handle

use alloc::string::String;
use alloc::vec::Vec;

use spci_abi::MemAccess;

use crate::mailbox::RxPayload;
use crate::memory::PageState;
use crate::state::MonitorState;
use crate::types::{ExecState, TransactionKind};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all monitor invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_page_transaction_consistency(state));
    violations.extend(check_transaction_receivers(state));
    violations.extend(check_sender_access(state));
    violations.extend(check_mailbox_consistency(state));
    violations.extend(check_direct_request_pairing(state));
    violations.extend(check_handle_monotonicity(state));

    violations
}

/// Invariant 1: pages and transactions point at each other
fn check_page_transaction_consistency(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (page, record) in state.memory.pages() {
        if !state.is_registered(record.owner) {
            violations.push(InvariantViolation {
                invariant: "page_transaction_consistency",
                description: alloc::format!(
                    "Page {:#x} owned by unregistered partition {}",
                    page,
                    record.owner
                ),
            });
        }
        if let PageState::InTransaction(handle) = record.state {
            let listed = state
                .memory
                .transaction(handle)
                .is_some_and(|tx| tx.pages().any(|p| p == page));
            if !listed {
                violations.push(InvariantViolation {
                    invariant: "page_transaction_consistency",
                    description: alloc::format!(
                        "Page {:#x} marked in transaction {} which does not hold it",
                        page,
                        handle
                    ),
                });
            }
        }
    }

    // Reverse direction
    for tx in state.memory.transactions() {
        for page in tx.pages() {
            let state_ok = state
                .memory
                .page(page)
                .is_some_and(|r| r.state == PageState::InTransaction(tx.handle) && r.owner == tx.sender);
            if !state_ok {
                violations.push(InvariantViolation {
                    invariant: "page_transaction_consistency",
                    description: alloc::format!(
                        "Transaction {} lists page {:#x} but the page is not held by it",
                        tx.handle,
                        page
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 2: receivers are valid
fn check_transaction_receivers(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for tx in state.memory.transactions() {
        if tx.receivers.is_empty() {
            violations.push(InvariantViolation {
                invariant: "transaction_receivers",
                description: alloc::format!("Transaction {} has no receivers", tx.handle),
            });
        }
        if matches!(tx.kind, TransactionKind::Donate | TransactionKind::Lend)
            && tx.receivers.len() != 1
        {
            violations.push(InvariantViolation {
                invariant: "transaction_receivers",
                description: alloc::format!(
                    "{:?} {} has {} receivers",
                    tx.kind,
                    tx.handle,
                    tx.receivers.len()
                ),
            });
        }
        for slot in &tx.receivers {
            if slot.id == tx.sender || !state.is_registered(slot.id) {
                violations.push(InvariantViolation {
                    invariant: "transaction_receivers",
                    description: alloc::format!(
                        "Transaction {} names invalid receiver {}",
                        tx.handle,
                        slot.id
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 3: the owner of a region that is out keeps at most read access
fn check_sender_access(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for tx in state.memory.transactions() {
        for page in tx.pages() {
            let Some(record) = state.memory.page(page) else {
                continue;
            };
            let original = tx.original.get(&page).copied().unwrap_or(MemAccess::empty());
            let allowed = match tx.kind {
                TransactionKind::Donate => MemAccess::empty(),
                TransactionKind::Lend | TransactionKind::Share => original.read_only(),
            };
            if !allowed.contains(record.access) {
                violations.push(InvariantViolation {
                    invariant: "sender_access",
                    description: alloc::format!(
                        "Owner of page {:#x} holds {:?} during {:?} {}",
                        page,
                        record.access,
                        tx.kind,
                        tx.handle
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 4: RX messages and in-flight TX buffers agree
fn check_mailbox_consistency(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (owner, mailbox) in state.mailboxes.iter() {
        if !state.is_registered(*owner) {
            violations.push(InvariantViolation {
                invariant: "mailbox_consistency",
                description: alloc::format!("Mailbox of unregistered partition {}", owner),
            });
        }

        if let Some(msg) = mailbox.unread_message() {
            if msg.destination != *owner {
                violations.push(InvariantViolation {
                    invariant: "mailbox_consistency",
                    description: alloc::format!(
                        "RX of {} holds a message for {}",
                        owner,
                        msg.destination
                    ),
                });
            }
            let in_flight = state
                .mailboxes
                .get(msg.source)
                .and_then(|m| m.tx_in_flight());
            if in_flight != Some(*owner) {
                violations.push(InvariantViolation {
                    invariant: "mailbox_consistency",
                    description: alloc::format!(
                        "Unread message from {} in RX of {} but sender TX is not in flight",
                        msg.source,
                        owner
                    ),
                });
            }
        }

        if let Some(dest) = mailbox.tx_in_flight() {
            let staged = state
                .mailboxes
                .get(dest)
                .and_then(|m| m.rx())
                .is_some_and(|p| matches!(p, RxPayload::Message(msg) if msg.source == *owner));
            if !staged {
                violations.push(InvariantViolation {
                    invariant: "mailbox_consistency",
                    description: alloc::format!(
                        "TX of {} in flight to {} but no message from it is staged",
                        owner,
                        dest
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 5: direct requests and requester states agree
fn check_direct_request_pairing(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (responder, requester) in &state.direct_requests {
        let waiting = state.partition(*requester).is_some_and(|p| {
            p.exec
                == ExecState::AwaitingDirectResponse {
                    responder: *responder,
                }
        });
        if !waiting {
            violations.push(InvariantViolation {
                invariant: "direct_request_pairing",
                description: alloc::format!(
                    "Request from {} to {} outstanding but requester is not waiting for it",
                    requester,
                    responder
                ),
            });
        }
    }

    for (id, partition) in &state.partitions {
        if let ExecState::AwaitingDirectResponse { responder } = partition.exec {
            if state.direct_requests.get(&responder) != Some(id) {
                violations.push(InvariantViolation {
                    invariant: "direct_request_pairing",
                    description: alloc::format!(
                        "{} awaits a response from {} with no request recorded",
                        id,
                        responder
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 6: next_handle is above every handle in use
fn check_handle_monotonicity(state: &MonitorState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let next = state.memory.next_handle();

    for tx in state.memory.transactions() {
        if tx.handle.is_donation() != (tx.kind == TransactionKind::Donate) {
            violations.push(InvariantViolation {
                invariant: "handle_monotonicity",
                description: alloc::format!(
                    "Transaction {} is a {:?} but its donation bit disagrees",
                    tx.handle,
                    tx.kind
                ),
            });
        }
        if tx.handle.sequence() >= next {
            violations.push(InvariantViolation {
                invariant: "handle_monotonicity",
                description: alloc::format!(
                    "Transaction handle {} >= next handle {:#x}",
                    tx.handle,
                    next
                ),
            });
        }
    }

    violations
}
