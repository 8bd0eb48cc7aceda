//! The monitor gateway
//!
//! [`Monitor`] owns the protocol state, the two collaborators and the audit
//! logs. The trapping layer calls [`Monitor::handle_call`] with the caller's
//! registers, and [`Monitor::resume`] / [`Monitor::interrupt`] when the
//! scheduler brings a parked partition back.

use alloc::vec::Vec;

use spci_abi::{PartitionId, Registers, Response};
use spci_core::{
    check_all_invariants, step, step_interrupt, step_resume, CallOutcome, CommitType,
    InvariantViolation, MailboxError, MonitorState, SpciCall, StepResult,
};
use spci_hal::{InterruptId, MemoryMapper, ResumeToken, Scheduler};

use crate::audit::{AuditLog, AuditSummary};
use crate::config::{ConfigError, MonitorConfig, PartitionConfig};

/// One secure partition monitor instance.
pub struct Monitor<S: Scheduler, M: MemoryMapper> {
    state: MonitorState,
    scheduler: S,
    mapper: M,
    audit: AuditLog,
    check_invariants: bool,
    /// Logical clock, one tick per entry into the monitor
    clock: u64,
}

impl<S: Scheduler, M: MemoryMapper> Monitor<S, M> {
    /// Build a monitor and register the configured partitions.
    ///
    /// Boot memory is handed to the mapper with its configured access.
    pub fn new(config: MonitorConfig, scheduler: S, mapper: M) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut monitor = Self {
            state: MonitorState::new(config.version, config.limits()),
            scheduler,
            mapper,
            audit: AuditLog::new(config.syslog_capacity, 0),
            check_invariants: config.check_invariants,
            clock: 0,
        };
        for partition in &config.partitions {
            monitor.add_partition(partition)?;
        }
        log::info!(
            "SPCI monitor {}.{} up with {} partitions",
            config.version.major,
            config.version.minor,
            config.partitions.len()
        );
        Ok(monitor)
    }

    /// Register one more partition and its boot memory.
    pub fn add_partition(&mut self, config: &PartitionConfig) -> Result<(), ConfigError> {
        self.state.register_partition(
            config.id,
            config.uuid,
            config.execution_contexts,
            config.properties,
        )?;
        let timestamp = self.tick();
        self.audit.append_internal_commit(
            CommitType::PartitionRegistered {
                partition: config.id,
            },
            timestamp,
        );

        for memory in &config.memory {
            let range = memory.range();
            self.state.add_memory(config.id, range, memory.access)?;
            self.mapper
                .set_access(config.id, range, memory.access)
                .map_err(|source| ConfigError::Mapper {
                    partition: config.id,
                    source,
                })?;
        }
        log::info!(
            "registered partition {} ({} memory ranges)",
            config.id,
            config.memory.len()
        );
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Handle a call trapped from `caller`.
    ///
    /// Calls that cannot be decoded are answered with an error response;
    /// nothing here fails.
    pub fn handle_call(&mut self, caller: PartitionId, registers: &Registers) -> CallOutcome {
        let timestamp = self.tick();
        let request_id = self.audit.begin_call(caller, registers, timestamp);

        let result = match SpciCall::decode(registers) {
            Ok((fid, call)) => {
                log::debug!("{} -> {}", caller, fid.function);
                step(
                    &mut self.state,
                    &mut self.scheduler,
                    &mut self.mapper,
                    caller,
                    fid,
                    call,
                )
            }
            Err(e) => {
                log::debug!(
                    "{} sent undecodable call {:#010x}: {}",
                    caller,
                    registers.fid(),
                    e
                );
                StepResult {
                    outcome: CallOutcome::Return(Response::error(e.into())),
                    commits: Vec::new(),
                }
            }
        };

        self.finish(caller, request_id, result, timestamp)
    }

    /// The scheduler resumes `partition`, parked under `token`.
    ///
    /// Returns the response that completes the parked call.
    pub fn resume(&mut self, partition: PartitionId, token: ResumeToken) -> CallOutcome {
        let timestamp = self.tick();
        let request_id = self.audit.begin_resume(partition, token.0, timestamp);
        let result = step_resume(&mut self.state, partition, token);
        self.finish(partition, request_id, result, timestamp)
    }

    /// An interrupt arrived for `partition`.
    ///
    /// A parked call is cancelled with `Interrupted`. Returns `None` when
    /// the partition was not parked.
    pub fn interrupt(&mut self, partition: PartitionId, irq: InterruptId) -> Option<CallOutcome> {
        let timestamp = self.tick();
        let request_id = self.audit.begin_interrupt(partition, irq.0, timestamp);
        match step_interrupt(&mut self.state, &mut self.scheduler, partition, irq.0) {
            Some(result) => Some(self.finish(partition, request_id, result, timestamp)),
            None => {
                self.audit.finish_ignored(partition, request_id, timestamp);
                None
            }
        }
    }

    fn finish(
        &mut self,
        caller: PartitionId,
        request_id: u64,
        result: StepResult,
        timestamp: u64,
    ) -> CallOutcome {
        let mutated = !result.commits.is_empty();
        let outcome = self.audit.finish(caller, request_id, result, timestamp);

        if mutated && self.check_invariants {
            for violation in check_all_invariants(&self.state) {
                log::warn!(
                    "invariant {} violated after request {}: {}",
                    violation.invariant,
                    request_id,
                    violation.description
                );
            }
        }
        outcome
    }

    // ========================================================================
    // Shared buffer access
    // ========================================================================

    /// Stand-in for `partition` writing its TX buffer.
    pub fn write_tx(&mut self, partition: PartitionId, bytes: &[u8]) -> Result<(), MailboxError> {
        self.state.mailboxes.stage_tx(partition, bytes.to_vec())
    }

    /// What `partition` would find in its RX buffer.
    pub fn read_rx(&self, partition: PartitionId) -> Option<&[u8]> {
        self.state
            .mailboxes
            .get(partition)
            .and_then(|mailbox| mailbox.rx())
            .map(|payload| payload.bytes())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut M {
        &mut self.mapper
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_summary(&self) -> AuditSummary {
        self.audit.summary()
    }

    /// Run every invariant check now.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        check_all_invariants(&self.state)
    }
}
