//! SPCI Monitor Core - Protocol State Machines
//!
//! This crate holds the partition-facing half of the secure partition
//! monitor: mailboxes, indirect and direct messaging, and memory
//! transactions. It never touches hardware. Parking a partition and
//! changing its page access go through the collaborator traits of
//! `spci-hal`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        spci-core                            │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │ MonitorState  │    │    step()     │                    │
//! │   │  - partitions │───▶│  dispatcher   │                    │
//! │   │  - mailboxes  │    └───────┬───────┘                    │
//! │   │  - memory     │            │                            │
//! │   └───────────────┘     ┌──────┴───────┐                    │
//! │                         ▼              ▼                    │
//! │                ┌──────────────┐ ┌──────────────┐            │
//! │                │   message    │ │    memory    │            │
//! │                │   engine     │ │    engine    │            │
//! │                └──────┬───────┘ └──────┬───────┘            │
//! └───────────────────────┼────────────────┼────────────────────┘
//!                         ▼                ▼
//!                    Scheduler        MemoryMapper
//! ```
//!
//! # Module Organization
//!
//! - `types` - Handles, partition records, call outcomes
//! - `call` - Register file to typed call
//! - `mailbox` - RX/TX buffer pairs
//! - `descriptor` - Memory region descriptor codec
//! - `message` - Send, poll, wait, yield, run and direct messaging
//! - `memory` - Donate, lend, share, retrieve, relinquish and reclaim
//! - `state` - MonitorState with all protocol data
//! - `step` - The dispatcher and audit commit types
//! - `invariants` - Runtime-checkable consistency assertions

#![no_std]
extern crate alloc;

pub mod call;
pub mod descriptor;
pub mod invariants;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod state;
pub mod step;
pub mod types;

#[cfg(test)]
mod testing;

pub use call::{uuid_from_words, uuid_to_words, SpciCall};
pub use descriptor::{DescriptorError, MemoryRegionDescriptor, ReceiverAccess};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use mailbox::{Mailbox, MailboxError, Mailboxes, RxPayload};
pub use memory::{MemoryError, MemoryState, PageRecord, PageState, RegionState, Transaction};
pub use message::MessageError;
pub use state::{Limits, MonitorState, StateError};
pub use step::{step, step_interrupt, step_resume, CommitType, StepError, StepResult};
pub use types::{
    CallOutcome, ExecState, Handle, Message, ParkReason, Partition, PartitionInfo,
    TransactionKind, HANDLE_DONATION_BIT,
};
