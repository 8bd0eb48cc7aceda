//! Core monitor types
//!
//! Pure data shared by the engines. Nothing here talks to a collaborator.

use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};
use spci_abi::{PartitionId, Response, Version};
use spci_hal::ResumeToken;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Set in every handle that names a donation.
pub const HANDLE_DONATION_BIT: u64 = 1 << 63;

/// Memory transaction handle
///
/// Returned to the sender split over two 32-bit registers (low word first).
/// The top bit marks donations; the rest is the allocation sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub fn is_donation(self) -> bool {
        self.0 & HANDLE_DONATION_BIT != 0
    }

    /// Allocation sequence number without the donation bit
    pub fn sequence(self) -> u64 {
        self.0 & !HANDLE_DONATION_BIT
    }

    pub fn from_words(lo: u32, hi: u32) -> Self {
        Handle(((hi as u64) << 32) | lo as u64)
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of memory transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Ownership moves to the receiver; irrevocable
    Donate,
    /// Exclusive access for one borrower; owner keeps read-only access
    Lend,
    /// Access for a set of borrowers; owner keeps read-only access
    Share,
}

// ============================================================================
// Partitions
// ============================================================================

/// Why a partition is parked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParkReason {
    /// `MSG_WAIT` with nothing to deliver
    Wait,
    /// Blocking `MSG_SEND`, resumed once `dest` releases its RX buffer
    BlockingSend { dest: PartitionId },
    /// `MSG_YIELD`
    Yield,
}

/// Execution state of a partition, as far as the protocol is concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    /// Running (or runnable) with no call outstanding
    Running,
    /// Suspended in the scheduler
    Parked {
        token: ResumeToken,
        reason: ParkReason,
        /// The event the partition waits for has happened
        ready: bool,
    },
    /// Sent a direct request and waits for its response
    AwaitingDirectResponse { responder: PartitionId },
}

/// Partition descriptor
pub struct Partition {
    /// Partition ID
    pub id: PartitionId,
    /// Service UUID reported by `PARTITION_INFO_GET`
    pub uuid: Uuid,
    /// Number of execution contexts
    pub execution_contexts: u16,
    /// Partition properties word
    pub properties: u32,
    /// Negotiated protocol version
    pub version: Option<Version>,
    /// Current execution state
    pub exec: ExecState,
}

impl Partition {
    pub fn new(id: PartitionId, uuid: Uuid, execution_contexts: u16, properties: u32) -> Self {
        Self {
            id,
            uuid,
            execution_contexts,
            properties,
            version: None,
            exec: ExecState::Running,
        }
    }

    /// Token and reason of the current suspension, if parked.
    pub fn parked(&self) -> Option<(ResumeToken, ParkReason, bool)> {
        match self.exec {
            ExecState::Parked {
                token,
                reason,
                ready,
            } => Some((token, reason, ready)),
            _ => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self.exec,
            ExecState::Parked {
                reason: ParkReason::Wait,
                ..
            }
        )
    }
}

/// Entry written to the RX buffer by `PARTITION_INFO_GET`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub execution_contexts: u16,
    pub properties: u32,
}

impl PartitionInfo {
    /// Encoded size of one entry
    pub const SIZE: usize = 8;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.0.to_le_bytes());
        out.extend_from_slice(&self.execution_contexts.to_le_bytes());
        out.extend_from_slice(&self.properties.to_le_bytes());
    }
}

// ============================================================================
// Messages
// ============================================================================

/// An indirect message staged in a mailbox
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: PartitionId,
    pub destination: PartitionId,
    pub blocking: bool,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ============================================================================
// Call outcomes
// ============================================================================

/// What the trapping layer must do once a call has been handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// Return `Response` to the caller
    Return(Response),
    /// Switch to `target` and resume it with `response`; the caller stays
    /// in whatever state the call left it
    Handoff {
        target: PartitionId,
        response: Response,
    },
    /// The caller is parked; its call completes when the scheduler resumes
    /// it with this token
    Suspended(ResumeToken),
}

impl CallOutcome {
    /// The response carried by this outcome, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            CallOutcome::Return(response) | CallOutcome::Handoff { response, .. } => {
                Some(response)
            }
            CallOutcome::Suspended(_) => None,
        }
    }

    /// Error code of a returned error.
    pub fn error_code(&self) -> Option<spci_abi::SpciError> {
        match self {
            CallOutcome::Return(response) => response.error_code(),
            _ => None,
        }
    }
}

impl From<Response> for CallOutcome {
    fn from(response: Response) -> Self {
        CallOutcome::Return(response)
    }
}
