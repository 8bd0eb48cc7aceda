//! Audit trail
//!
//! Every entry into the monitor flows through [`AuditLog`]:
//! 1. Log the request (trapped call, resume or interrupt) to SysLog
//! 2. The caller runs the dispatcher
//! 3. Append the reported commits to CommitLog
//! 4. Log the outcome to SysLog

pub mod commitlog;
pub mod syslog;

use spci_abi::{PartitionId, Registers};
use spci_core::{CallOutcome, StepResult};

pub use commitlog::{Commit, CommitId, CommitLog};
pub use syslog::{EventId, OutcomeRecord, SysEvent, SysEventType, SysLog};

/// Both audit logs of one monitor.
pub struct AuditLog {
    /// Request/response log
    syslog: SysLog,
    /// State mutation log
    commitlog: CommitLog,
}

impl AuditLog {
    pub fn new(syslog_capacity: usize, timestamp: u64) -> Self {
        Self {
            syslog: SysLog::new(syslog_capacity),
            commitlog: CommitLog::new(timestamp),
        }
    }

    pub fn begin_call(
        &mut self,
        sender: PartitionId,
        registers: &Registers,
        timestamp: u64,
    ) -> EventId {
        self.syslog.log_request(sender, registers, timestamp)
    }

    pub fn begin_resume(&mut self, partition: PartitionId, token: u64, timestamp: u64) -> EventId {
        self.syslog.log_resume(partition, token, timestamp)
    }

    pub fn begin_interrupt(
        &mut self,
        partition: PartitionId,
        interrupt_id: u32,
        timestamp: u64,
    ) -> EventId {
        self.syslog.log_interrupt(partition, interrupt_id, timestamp)
    }

    /// Record the commits and outcome of a step and hand the outcome back.
    pub fn finish(
        &mut self,
        sender: PartitionId,
        request_id: EventId,
        result: StepResult,
        timestamp: u64,
    ) -> CallOutcome {
        for commit in result.commits {
            self.commitlog.append(commit, Some(request_id), timestamp);
        }
        self.syslog.log_response(
            sender,
            request_id,
            OutcomeRecord::from(&result.outcome),
            timestamp,
        );
        result.outcome
    }

    /// Record a request that produced nothing.
    pub fn finish_ignored(&mut self, sender: PartitionId, request_id: EventId, timestamp: u64) {
        self.syslog
            .log_response(sender, request_id, OutcomeRecord::Ignored, timestamp);
    }

    /// Append a commit that no partition request caused (boot registration).
    pub fn append_internal_commit(
        &mut self,
        commit_type: spci_core::CommitType,
        timestamp: u64,
    ) -> CommitId {
        self.commitlog.append(commit_type, None, timestamp)
    }

    pub fn syslog(&self) -> &SysLog {
        &self.syslog
    }

    pub fn commitlog(&self) -> &CommitLog {
        &self.commitlog
    }

    pub fn verify_integrity(&self) -> bool {
        self.commitlog.verify_integrity()
    }

    pub fn summary(&self) -> AuditSummary {
        AuditSummary {
            syslog_len: self.syslog.len(),
            syslog_next_id: self.syslog.next_id(),
            commitlog_len: self.commitlog.len(),
            commitlog_seq: self.commitlog.current_seq(),
            commitlog_head: self.commitlog.head(),
        }
    }
}

/// Summary of the audit logs (for debugging/monitoring).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditSummary {
    pub syslog_len: usize,
    pub syslog_next_id: u64,
    pub commitlog_len: usize,
    pub commitlog_seq: u64,
    pub commitlog_head: CommitId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use spci_abi::{spci_fid, CallWidth, Function, Response, Version};
    use spci_core::CommitType;

    #[test]
    fn test_finish_links_commits_to_request() {
        let mut audit = AuditLog::new(64, 0);
        let regs = Registers::call(
            spci_fid(CallWidth::Smc32, Function::Version),
            [9, 0, 0, 0, 0, 0, 0],
        );

        let request_id = audit.begin_call(PartitionId(1), &regs, 1);
        let outcome = audit.finish(
            PartitionId(1),
            request_id,
            StepResult {
                outcome: CallOutcome::Return(Response::Version(Version::COMPILED)),
                commits: vec![CommitType::VersionNegotiated {
                    partition: PartitionId(1),
                    version: Version::COMPILED,
                }],
            },
            1,
        );

        assert_eq!(
            outcome,
            CallOutcome::Return(Response::Version(Version::COMPILED))
        );
        let summary = audit.summary();
        assert_eq!(summary.syslog_len, 2);
        assert_eq!(summary.commitlog_len, 2);
        assert_eq!(summary.commitlog_seq, 1);
        assert_eq!(audit.commitlog().caused_by(request_id).count(), 1);
        assert!(audit.verify_integrity());
    }

    #[test]
    fn test_ignored_interrupt_is_logged() {
        let mut audit = AuditLog::new(64, 0);
        let request_id = audit.begin_interrupt(PartitionId(2), 33, 5);
        audit.finish_ignored(PartitionId(2), request_id, 5);

        assert_eq!(
            audit.syslog().response_to(request_id),
            Some(&OutcomeRecord::Ignored)
        );
        assert_eq!(audit.commitlog().len(), 1);
    }
}
