//! SPCI Monitor - the gateway partitions call into
//!
//! Wraps the `spci-core` dispatcher with configuration and an audit trail:
//!
//! - **Config**: `MonitorConfig` with limits and the partitions to host
//! - **SysLog**: every request, resumption and interrupt with its outcome
//! - **CommitLog**: hash-chained record of every state mutation
//!
//! # Call Flow
//!
//! ```text
//! trapped call ──▶ Monitor::handle_call
//!                    │  1. SysLog request
//!                    │  2. SpciCall::decode
//!                    │  3. spci_core::step
//!                    │  4. CommitLog append
//!                    │  5. SysLog response
//!                    ▼
//!               CallOutcome (return / hand-off / suspended)
//! ```

#![no_std]
extern crate alloc;

pub mod audit;
pub mod config;
pub mod monitor;

pub use audit::{
    AuditLog, AuditSummary, Commit, CommitId, CommitLog, EventId, OutcomeRecord, SysEvent,
    SysEventType, SysLog,
};
pub use config::{ConfigError, MemoryConfig, MonitorConfig, PartitionConfig};
pub use monitor::Monitor;
