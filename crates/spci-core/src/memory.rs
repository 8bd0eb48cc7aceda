//! Memory transaction engine
//!
//! Tracks which partition owns every page the monitor knows about and runs
//! the donate/lend/share lifecycle:
//!
//! ```text
//! Owned(s) --donate--> Donating(s->r) --retrieve--> Owned(r)
//! Owned(s) --lend----> Lent(s, b) --relinquish/reclaim--> Owned(s)
//! Owned(s) --share---> Shared(s, {b..}) --last relinquish/reclaim--> Owned(s)
//! ```
//!
//! Every handler validates completely before it touches anything. Changes
//! to the mapper are applied through an [`AccessJournal`] and undone if any
//! of them fails, so a failed call leaves no trace.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spci_abi::{MemAccess, PageRange, PartitionId, SpciError};
use spci_hal::{HalError, MemoryMapper};
use thiserror::Error;

use crate::descriptor::{DescriptorError, MemoryRegionDescriptor};
use crate::mailbox::{MailboxError, RxPayload};
use crate::state::MonitorState;
use crate::step::CommitType;
use crate::types::{Handle, TransactionKind, HANDLE_DONATION_BIT};

/// Memory engine errors
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("fragmented descriptor: {fragment} of {total} bytes")]
    Fragmented { total: u32, fragment: u32 },
    #[error("malformed descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("descriptor sender {0} is not the caller")]
    SenderMismatch(PartitionId),
    #[error("descriptor names no receivers")]
    NoReceivers,
    #[error("{kind:?} needs exactly one receiver, got {count}")]
    ReceiverCount { kind: TransactionKind, count: usize },
    #[error("invalid receiver {0}")]
    InvalidReceiver(PartitionId),
    #[error("duplicate receiver {0}")]
    DuplicateReceiver(PartitionId),
    #[error("descriptor names no page ranges")]
    NoRanges,
    #[error("invalid page range at {0:#x}")]
    InvalidRange(u64),
    #[error("page ranges overlap")]
    OverlappingRanges,
    #[error("page {0:#x} backs a mailbox buffer")]
    MailboxBuffer(u64),
    #[error("page {0:#x} is not owned by the sender")]
    NotOwner(u64),
    #[error("requested access exceeds granted access")]
    PermissionEscalation,
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("transaction table full")]
    TableFull,
    #[error("unknown transaction {0}")]
    UnknownHandle(Handle),
    #[error("{0} has nothing pending in this transaction")]
    NotPendingReceiver(PartitionId),
    #[error("{0} has no retrieve request outstanding")]
    NoRetrieveRequest(PartitionId),
    #[error("{0} does not hold this region")]
    NotBorrower(PartitionId),
    #[error("donations cannot be reclaimed")]
    Irrevocable,
    #[error("{0} is not the owner")]
    NotSender(PartitionId),
    #[error("mapper: {0}")]
    Mapper(#[from] HalError),
}

impl From<MemoryError> for SpciError {
    fn from(value: MemoryError) -> Self {
        match value {
            MemoryError::Fragmented { .. }
            | MemoryError::Descriptor(_)
            | MemoryError::SenderMismatch(_)
            | MemoryError::NoReceivers
            | MemoryError::ReceiverCount { .. }
            | MemoryError::InvalidReceiver(_)
            | MemoryError::DuplicateReceiver(_)
            | MemoryError::NoRanges
            | MemoryError::InvalidRange(_)
            | MemoryError::OverlappingRanges
            | MemoryError::UnknownHandle(_)
            | MemoryError::NotPendingReceiver(_)
            | MemoryError::NoRetrieveRequest(_)
            | MemoryError::NotBorrower(_) => SpciError::InvalidParameter,
            MemoryError::MailboxBuffer(_)
            | MemoryError::NotOwner(_)
            | MemoryError::PermissionEscalation
            | MemoryError::Irrevocable
            | MemoryError::NotSender(_) => SpciError::Denied,
            MemoryError::TableFull => SpciError::NoMemory,
            MemoryError::Mailbox(e) => e.into(),
            MemoryError::Mapper(e) => e.into(),
        }
    }
}

// ============================================================================
// Ownership records
// ============================================================================

/// State of a single page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Held by its owner alone
    Owned,
    /// Part of a live transaction
    InTransaction(Handle),
}

/// Ownership record of a single page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRecord {
    pub owner: PartitionId,
    /// Access the owner currently has
    pub access: MemAccess,
    pub state: PageState,
}

/// Progress of one receiver through a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    /// Offered, not yet asked for
    Pending,
    /// `MEM_RETRIEVE_REQ` accepted with this access
    Requested(MemAccess),
    /// Mapped with this access
    Retrieved(MemAccess),
    /// Gave the region back
    Relinquished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverSlot {
    pub id: PartitionId,
    /// Access offered by the sender
    pub granted: MemAccess,
    pub state: ReceiverState,
}

impl ReceiverSlot {
    /// Still entitled to the region
    pub fn is_holder(&self) -> bool {
        self.state != ReceiverState::Relinquished
    }
}

/// A memory transaction
#[derive(Clone, Debug)]
pub struct Transaction {
    pub handle: Handle,
    pub kind: TransactionKind,
    pub sender: PartitionId,
    pub receivers: Vec<ReceiverSlot>,
    pub ranges: Vec<PageRange>,
    /// Sender access per page before the transaction
    pub original: BTreeMap<u64, MemAccess>,
}

impl Transaction {
    pub fn receiver(&self, id: PartitionId) -> Option<&ReceiverSlot> {
        self.receivers.iter().find(|r| r.id == id)
    }

    fn receiver_mut(&mut self, id: PartitionId) -> Option<&mut ReceiverSlot> {
        self.receivers.iter_mut().find(|r| r.id == id)
    }

    /// Base address of every page in the transaction
    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.pages())
    }
}

/// Ownership state of a page as seen from outside
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionState {
    Owned(PartitionId),
    Donating {
        sender: PartitionId,
        receiver: PartitionId,
    },
    Lent {
        sender: PartitionId,
        borrower: PartitionId,
    },
    Shared {
        sender: PartitionId,
        borrowers: Vec<PartitionId>,
    },
}

/// Page ownership table and transaction table
#[derive(Clone, Debug)]
pub struct MemoryState {
    pages: BTreeMap<u64, PageRecord>,
    transactions: BTreeMap<Handle, Transaction>,
    next_handle: u64,
    max_transactions: usize,
}

impl MemoryState {
    pub fn new(max_transactions: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            transactions: BTreeMap::new(),
            next_handle: 1,
            max_transactions,
        }
    }

    pub(crate) fn insert_owned(&mut self, owner: PartitionId, range: PageRange, access: MemAccess) {
        for page in range.pages() {
            self.pages.insert(
                page,
                PageRecord {
                    owner,
                    access,
                    state: PageState::Owned,
                },
            );
        }
    }

    fn alloc_handle(&mut self, kind: TransactionKind) -> Handle {
        let sequence = self.next_handle;
        self.next_handle += 1;
        match kind {
            TransactionKind::Donate => Handle(sequence | HANDLE_DONATION_BIT),
            TransactionKind::Lend | TransactionKind::Share => Handle(sequence),
        }
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    pub fn page(&self, page: u64) -> Option<&PageRecord> {
        self.pages.get(&page)
    }

    pub fn pages(&self) -> impl Iterator<Item = (u64, &PageRecord)> {
        self.pages.iter().map(|(&p, r)| (p, r))
    }

    pub fn transaction(&self, handle: Handle) -> Option<&Transaction> {
        self.transactions.get(&handle)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Number of transactions still holding pages
    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// Sequence number the next handle will carry
    pub fn next_handle(&self) -> u64 {
        self.next_handle
    }

    /// `handle` was allocated at some point, whether or not it is still open.
    pub fn was_issued(&self, handle: Handle) -> bool {
        (1..self.next_handle).contains(&handle.sequence())
    }

    /// True when `partition` solely owns every page of `range`.
    pub fn owns(&self, partition: PartitionId, range: &PageRange) -> bool {
        range.pages().all(|p| {
            self.pages
                .get(&p)
                .is_some_and(|r| r.owner == partition && r.state == PageState::Owned)
        })
    }

    /// Ownership state of `page`.
    pub fn region_state(&self, page: u64) -> Option<RegionState> {
        let record = self.pages.get(&page)?;
        let handle = match record.state {
            PageState::Owned => return Some(RegionState::Owned(record.owner)),
            PageState::InTransaction(handle) => handle,
        };
        let tx = self.transactions.get(&handle)?;
        let holders: Vec<PartitionId> = tx
            .receivers
            .iter()
            .filter(|r| r.is_holder())
            .map(|r| r.id)
            .collect();
        Some(match tx.kind {
            TransactionKind::Donate => RegionState::Donating {
                sender: tx.sender,
                receiver: *holders.first()?,
            },
            TransactionKind::Lend => RegionState::Lent {
                sender: tx.sender,
                borrower: *holders.first()?,
            },
            TransactionKind::Share => RegionState::Shared {
                sender: tx.sender,
                borrowers: holders,
            },
        })
    }

    /// Access `partition` should currently have on `page`.
    pub fn expected_access(&self, partition: PartitionId, page: u64) -> MemAccess {
        let Some(record) = self.pages.get(&page) else {
            return MemAccess::empty();
        };
        let mut access = if record.owner == partition {
            record.access
        } else {
            MemAccess::empty()
        };
        if let PageState::InTransaction(handle) = record.state {
            if let Some(slot) = self
                .transactions
                .get(&handle)
                .and_then(|tx| tx.receiver(partition))
            {
                if let ReceiverState::Retrieved(granted) = slot.state {
                    access |= granted;
                }
            }
        }
        access
    }
}

// ============================================================================
// Mapper journal
// ============================================================================

/// One planned access change
#[derive(Clone, Copy, Debug)]
struct AccessChange {
    partition: PartitionId,
    page: u64,
    from: MemAccess,
    to: MemAccess,
}

/// Applied mapper changes, for rollback
struct AccessJournal {
    applied: Vec<AccessChange>,
}

impl AccessJournal {
    /// Apply all `changes` or none of them.
    fn apply<M: MemoryMapper>(mapper: &mut M, changes: &[AccessChange]) -> Result<(), HalError> {
        let mut journal = AccessJournal {
            applied: Vec::with_capacity(changes.len()),
        };
        for change in changes.iter().filter(|c| c.from != c.to) {
            if let Err(e) = mapper.set_access(change.partition, PageRange::page(change.page), change.to)
            {
                journal.rollback(mapper);
                return Err(e);
            }
            journal.applied.push(*change);
        }
        Ok(())
    }

    fn rollback<M: MemoryMapper>(self, mapper: &mut M) {
        for change in self.applied.into_iter().rev() {
            if let Err(e) =
                mapper.set_access(change.partition, PageRange::page(change.page), change.from)
            {
                log::warn!(
                    "rollback of page {:#x} for {} failed: {}",
                    change.page,
                    change.partition,
                    e
                );
            }
        }
    }
}

// ============================================================================
// Transfer: donate, lend, share
// ============================================================================

/// Start a donate, lend or share of the region described in the caller's
/// TX buffer.
pub fn transfer<M: MemoryMapper>(
    state: &mut MonitorState,
    mapper: &mut M,
    caller: PartitionId,
    kind: TransactionKind,
    total_length: u32,
    fragment_length: u32,
    commits: &mut Vec<CommitType>,
) -> Result<Handle, MemoryError> {
    if total_length == 0 || total_length != fragment_length {
        return Err(MemoryError::Fragmented {
            total: total_length,
            fragment: fragment_length,
        });
    }
    let desc = {
        let bytes = state
            .mailboxes
            .require(caller)?
            .peek_tx(total_length as usize)?;
        MemoryRegionDescriptor::decode(bytes)?
    };

    validate_descriptor(state, caller, kind, &desc)?;

    // Ownership and permissions
    let mut changes = Vec::new();
    let mut original = BTreeMap::new();
    for range in &desc.ranges {
        if state.mailboxes.overlaps_buffers(caller, range) {
            return Err(MemoryError::MailboxBuffer(range.base));
        }
        for page in range.pages() {
            let record = match state.memory.page(page) {
                Some(r) if r.owner == caller && r.state == PageState::Owned => r,
                _ => return Err(MemoryError::NotOwner(page)),
            };
            if desc.receivers.iter().any(|r| !record.access.contains(r.access)) {
                return Err(MemoryError::PermissionEscalation);
            }
            let to = match kind {
                TransactionKind::Donate => MemAccess::empty(),
                TransactionKind::Lend | TransactionKind::Share => record.access.read_only(),
            };
            original.insert(page, record.access);
            changes.push(AccessChange {
                partition: caller,
                page,
                from: record.access,
                to,
            });
        }
    }

    // Resources
    let encoded = desc.encode();
    for receiver in &desc.receivers {
        let mailbox = state.mailboxes.require(receiver.id)?;
        if encoded.len() > mailbox.capacity() {
            return Err(MailboxError::TooLarge {
                len: encoded.len(),
                capacity: mailbox.capacity(),
            }
            .into());
        }
    }
    if state.memory.active_count() >= state.memory.max_transactions {
        return Err(MemoryError::TableFull);
    }
    for receiver in &desc.receivers {
        if !state.mailboxes.require(receiver.id)?.rx_is_free() {
            return Err(MailboxError::RxBusy.into());
        }
    }

    AccessJournal::apply(mapper, &changes)?;

    // Commit
    let handle = state.memory.alloc_handle(kind);
    for change in &changes {
        if let Some(record) = state.memory.pages.get_mut(&change.page) {
            record.access = change.to;
            record.state = PageState::InTransaction(handle);
        }
    }
    for receiver in &desc.receivers {
        state.mailboxes.stage_rx(
            receiver.id,
            RxPayload::Descriptor {
                handle,
                bytes: encoded.clone(),
            },
        )?;
    }
    state
        .mailboxes
        .require_mut(caller)?
        .read_tx(total_length as usize)?;

    let receivers: Vec<PartitionId> = desc.receivers.iter().map(|r| r.id).collect();
    state.memory.transactions.insert(
        handle,
        Transaction {
            handle,
            kind,
            sender: caller,
            receivers: desc
                .receivers
                .iter()
                .map(|r| ReceiverSlot {
                    id: r.id,
                    granted: r.access,
                    state: ReceiverState::Pending,
                })
                .collect(),
            ranges: desc.ranges.clone(),
            original,
        },
    );

    log::info!(
        "{:?} {} from {} to {:?}, {} pages",
        kind,
        handle,
        caller,
        receivers,
        desc.page_count()
    );
    commits.push(CommitType::TransactionCreated {
        handle,
        kind,
        sender: caller,
        receivers,
        pages: desc.page_count(),
    });
    Ok(handle)
}

/// Structural checks on a decoded descriptor.
fn validate_descriptor(
    state: &MonitorState,
    caller: PartitionId,
    kind: TransactionKind,
    desc: &MemoryRegionDescriptor,
) -> Result<(), MemoryError> {
    if desc.sender != caller {
        return Err(MemoryError::SenderMismatch(desc.sender));
    }

    if desc.receivers.is_empty() {
        return Err(MemoryError::NoReceivers);
    }
    if matches!(kind, TransactionKind::Donate | TransactionKind::Lend) && desc.receivers.len() != 1
    {
        return Err(MemoryError::ReceiverCount {
            kind,
            count: desc.receivers.len(),
        });
    }
    for (i, receiver) in desc.receivers.iter().enumerate() {
        if receiver.id == caller
            || receiver.id == PartitionId::MONITOR
            || !state.is_registered(receiver.id)
            || receiver.access.is_empty()
        {
            return Err(MemoryError::InvalidReceiver(receiver.id));
        }
        if desc.receivers[..i].iter().any(|r| r.id == receiver.id) {
            return Err(MemoryError::DuplicateReceiver(receiver.id));
        }
    }

    if desc.ranges.is_empty() {
        return Err(MemoryError::NoRanges);
    }
    for (i, range) in desc.ranges.iter().enumerate() {
        if !range.is_aligned() || range.is_empty() || range.end().is_none() {
            return Err(MemoryError::InvalidRange(range.base));
        }
        if desc.ranges[..i].iter().any(|r| r.overlaps(range)) {
            return Err(MemoryError::OverlappingRanges);
        }
    }
    Ok(())
}

// ============================================================================
// Retrieve
// ============================================================================

/// Receiver asks for the region of `handle` with `access`.
///
/// An empty `access` asks for everything that was offered. Returns the
/// access that will be mapped on `retrieve_response`.
pub fn retrieve_request(
    state: &mut MonitorState,
    caller: PartitionId,
    handle: Handle,
    access: MemAccess,
    commits: &mut Vec<CommitType>,
) -> Result<MemAccess, MemoryError> {
    let tx = state
        .memory
        .transactions
        .get_mut(&handle)
        .ok_or(MemoryError::UnknownHandle(handle))?;
    let slot = tx
        .receiver_mut(caller)
        .filter(|slot| slot.state == ReceiverState::Pending)
        .ok_or(MemoryError::NotPendingReceiver(caller))?;

    let access = if access.is_empty() {
        slot.granted
    } else {
        access
    };
    if !slot.granted.contains(access) {
        log::warn!(
            "{} asked for {:?} on {}, offered {:?}",
            caller,
            access,
            handle,
            slot.granted
        );
        return Err(MemoryError::PermissionEscalation);
    }

    slot.state = ReceiverState::Requested(access);
    commits.push(CommitType::RetrieveRequested {
        handle,
        receiver: caller,
        access,
    });
    Ok(access)
}

/// Receiver confirms its retrieve request; the region is mapped.
pub fn retrieve_response<M: MemoryMapper>(
    state: &mut MonitorState,
    mapper: &mut M,
    caller: PartitionId,
    handle: Handle,
    commits: &mut Vec<CommitType>,
) -> Result<(), MemoryError> {
    let tx = state
        .memory
        .transactions
        .get(&handle)
        .ok_or(MemoryError::UnknownHandle(handle))?;
    let access = match tx.receiver(caller).map(|slot| slot.state) {
        Some(ReceiverState::Requested(access)) => access,
        _ => return Err(MemoryError::NoRetrieveRequest(caller)),
    };

    let changes: Vec<AccessChange> = tx
        .pages()
        .map(|page| AccessChange {
            partition: caller,
            page,
            from: MemAccess::empty(),
            to: access,
        })
        .collect();
    let kind = tx.kind;
    let sender = tx.sender;

    AccessJournal::apply(mapper, &changes)?;

    let memory = &mut state.memory;
    let Some(tx) = memory.transactions.get_mut(&handle) else {
        return Err(MemoryError::UnknownHandle(handle));
    };
    if let Some(slot) = tx.receiver_mut(caller) {
        slot.state = ReceiverState::Retrieved(access);
    }

    if kind == TransactionKind::Donate {
        // The handle bit alone answers a later reclaim
        memory.transactions.remove(&handle);
        for change in &changes {
            if let Some(record) = memory.pages.get_mut(&change.page) {
                record.owner = caller;
                record.access = access;
                record.state = PageState::Owned;
            }
        }
        log::info!("donation {} from {} to {} complete", handle, sender, caller);
        commits.push(CommitType::Donated {
            handle,
            from: sender,
            to: caller,
        });
    } else {
        commits.push(CommitType::Retrieved {
            handle,
            receiver: caller,
            access,
        });
    }
    Ok(())
}

// ============================================================================
// Relinquish and reclaim
// ============================================================================

/// Borrower gives a lent or shared region back.
///
/// The region returns to its owner when the last holder relinquishes.
pub fn relinquish<M: MemoryMapper>(
    state: &mut MonitorState,
    mapper: &mut M,
    caller: PartitionId,
    handle: Handle,
    commits: &mut Vec<CommitType>,
) -> Result<(), MemoryError> {
    let tx = state
        .memory
        .transactions
        .get(&handle)
        .ok_or(MemoryError::UnknownHandle(handle))?;
    let access = match tx.receiver(caller).map(|slot| slot.state) {
        Some(ReceiverState::Retrieved(access)) if tx.kind != TransactionKind::Donate => access,
        _ => return Err(MemoryError::NotBorrower(caller)),
    };

    let mut changes: Vec<AccessChange> = tx
        .pages()
        .map(|page| AccessChange {
            partition: caller,
            page,
            from: access,
            to: MemAccess::empty(),
        })
        .collect();
    let last = !tx.receivers.iter().any(|r| r.id != caller && r.is_holder());
    if last {
        changes.extend(restore_sender(&state.memory, tx));
    }

    AccessJournal::apply(mapper, &changes)?;

    if let Some(slot) = state
        .memory
        .transactions
        .get_mut(&handle)
        .and_then(|tx| tx.receiver_mut(caller))
    {
        slot.state = ReceiverState::Relinquished;
    }
    commits.push(CommitType::Relinquished {
        handle,
        borrower: caller,
    });
    if last {
        close_transaction(state, handle, commits);
    }
    Ok(())
}

/// Owner takes a lent or shared region back, revoking every borrower.
pub fn reclaim<M: MemoryMapper>(
    state: &mut MonitorState,
    mapper: &mut M,
    caller: PartitionId,
    handle: Handle,
    commits: &mut Vec<CommitType>,
) -> Result<(), MemoryError> {
    if handle.is_donation() && state.memory.was_issued(handle) {
        log::warn!("{} tried to reclaim donation {}", caller, handle);
        return Err(MemoryError::Irrevocable);
    }
    let tx = state
        .memory
        .transactions
        .get(&handle)
        .ok_or(MemoryError::UnknownHandle(handle))?;
    if tx.sender != caller {
        return Err(MemoryError::NotSender(caller));
    }

    let mut changes = Vec::new();
    for slot in &tx.receivers {
        if let ReceiverState::Retrieved(access) = slot.state {
            changes.extend(tx.pages().map(|page| AccessChange {
                partition: slot.id,
                page,
                from: access,
                to: MemAccess::empty(),
            }));
        }
    }
    changes.extend(restore_sender(&state.memory, tx));

    AccessJournal::apply(mapper, &changes)?;

    commits.push(CommitType::Reclaimed {
        handle,
        sender: caller,
    });
    close_transaction(state, handle, commits);
    Ok(())
}

/// Changes that give the sender its original access back.
fn restore_sender(memory: &MemoryState, tx: &Transaction) -> Vec<AccessChange> {
    tx.pages()
        .map(|page| AccessChange {
            partition: tx.sender,
            page,
            from: memory
                .page(page)
                .map(|r| r.access)
                .unwrap_or(MemAccess::empty()),
            to: tx
                .original
                .get(&page)
                .copied()
                .unwrap_or(MemAccess::empty()),
        })
        .collect()
}

/// Return every page to the sender and forget the transaction.
fn close_transaction(state: &mut MonitorState, handle: Handle, commits: &mut Vec<CommitType>) {
    let Some(tx) = state.memory.transactions.remove(&handle) else {
        return;
    };
    for page in tx.pages() {
        if let Some(record) = state.memory.pages.get_mut(&page) {
            record.owner = tx.sender;
            record.access = tx.original.get(&page).copied().unwrap_or(record.access);
            record.state = PageState::Owned;
        }
    }
    for slot in &tx.receivers {
        if let Some(mailbox) = state.mailboxes.get_mut(slot.id) {
            mailbox.discard_descriptor(handle);
        }
    }
    commits.push(CommitType::TransactionClosed { handle });
}
