//! System Event Log (SysLog)
//!
//! Records every call that enters the monitor (request + response) for the
//! audit trail. This is separate from the CommitLog: the SysLog says what
//! partitions asked for, the CommitLog says what changed.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use spci_abi::{PartitionId, Registers};
use spci_core::CallOutcome;

/// Monotonic event identifier
pub type EventId = u64;

/// A system event (request or response).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Partition the event concerns
    pub sender: PartitionId,
    /// Monitor tick at which the event was recorded
    pub timestamp: u64,
    /// Event type
    pub event_type: SysEventType,
}

/// Type of system event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysEventType {
    /// Call trapped from a partition
    Request {
        /// Raw function identifier from w0
        function_id: u32,
        /// Argument registers x1..x7
        args: [u64; 7],
    },
    /// Scheduler resumed a parked partition
    Resume { token: u64 },
    /// Interrupt raised against a partition
    Interrupt { interrupt_id: u32 },
    /// What the monitor did with a request
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        outcome: OutcomeRecord,
    },
}

/// Serializable summary of a [`CallOutcome`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeRecord {
    /// Registers returned to the caller
    Return { registers: [u64; 8] },
    /// Registers delivered to another partition that now runs
    Handoff {
        target: PartitionId,
        registers: [u64; 8],
    },
    /// Caller parked under this token
    Suspended { token: u64 },
    /// Interrupt found nothing to cancel
    Ignored,
}

impl From<&CallOutcome> for OutcomeRecord {
    fn from(outcome: &CallOutcome) -> Self {
        match outcome {
            CallOutcome::Return(response) => OutcomeRecord::Return {
                registers: response.into_registers().0,
            },
            CallOutcome::Handoff { target, response } => OutcomeRecord::Handoff {
                target: *target,
                registers: response.into_registers().0,
            },
            CallOutcome::Suspended(token) => OutcomeRecord::Suspended { token: token.0 },
        }
    }
}

/// System event log for auditing.
///
/// Records every request and response. Events are append-only with
/// monotonic IDs; the oldest are dropped once `capacity` is exceeded.
pub struct SysLog {
    /// Event entries (append-only)
    events: Vec<SysEvent>,
    /// Next event ID to assign
    next_id: EventId,
    /// Maximum number of events kept
    capacity: usize,
}

impl SysLog {
    /// Create a new empty SysLog keeping at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Log a trapped call.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(
        &mut self,
        sender: PartitionId,
        registers: &Registers,
        timestamp: u64,
    ) -> EventId {
        let mut args = [0u64; 7];
        args.copy_from_slice(&registers.0[1..]);
        self.push(
            sender,
            timestamp,
            SysEventType::Request {
                function_id: registers.fid(),
                args,
            },
        )
    }

    /// Log a resumption. Returns its ID like a request.
    pub fn log_resume(&mut self, partition: PartitionId, token: u64, timestamp: u64) -> EventId {
        self.push(partition, timestamp, SysEventType::Resume { token })
    }

    /// Log an interrupt. Returns its ID like a request.
    pub fn log_interrupt(
        &mut self,
        partition: PartitionId,
        interrupt_id: u32,
        timestamp: u64,
    ) -> EventId {
        self.push(partition, timestamp, SysEventType::Interrupt { interrupt_id })
    }

    /// Log the outcome of an earlier request.
    pub fn log_response(
        &mut self,
        sender: PartitionId,
        request_id: EventId,
        outcome: OutcomeRecord,
        timestamp: u64,
    ) {
        self.push(
            sender,
            timestamp,
            SysEventType::Response {
                request_id,
                outcome,
            },
        );
    }

    fn push(&mut self, sender: PartitionId, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(SysEvent {
            id,
            sender,
            timestamp,
            event_type,
        });

        self.trim_if_needed();
        id
    }

    /// Get all events.
    pub fn events(&self) -> &[SysEvent] {
        &self.events
    }

    /// Get events in an ID range.
    pub fn get_range(&self, start_id: EventId, end_id: EventId) -> Vec<&SysEvent> {
        self.events
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .collect()
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&SysEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// The response logged for `request_id`, if still in the log.
    pub fn response_to(&self, request_id: EventId) -> Option<&OutcomeRecord> {
        self.events.iter().find_map(|e| match &e.event_type {
            SysEventType::Response {
                request_id: id,
                outcome,
            } if *id == request_id => Some(outcome),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}
