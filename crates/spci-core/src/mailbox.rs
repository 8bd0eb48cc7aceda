//! RX/TX mailboxes
//!
//! Every partition may bind one pair of buffers. Each direction holds at most
//! one payload:
//!
//! - RX is written by the monitor (a message, a memory descriptor or a
//!   partition-info list) and stays occupied until the owner releases it
//! - TX is written by the owner and consumed by a send or memory call; a
//!   sent message keeps TX in flight until the destination reads it
//!
//! Nothing is ever queued or dropped. A writer that finds a slot occupied
//! gets `Busy`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spci_abi::{PageRange, PartitionId, SpciError, PAGE_SIZE};
use thiserror::Error;

use crate::types::{Handle, Message};

/// Mailbox errors
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox already mapped")]
    AlreadyMapped,
    #[error("mailbox not mapped")]
    NotMapped,
    #[error("buffer address {0:#x} is zero or not page aligned")]
    InvalidAddress(u64),
    #[error("RX and TX buffers overlap")]
    Overlap,
    #[error("invalid page count {0}")]
    InvalidPageCount(u32),
    #[error("RX buffer occupied")]
    RxBusy,
    #[error("RX buffer empty")]
    RxEmpty,
    #[error("TX buffer still in flight")]
    TxBusy,
    #[error("TX holds {staged} bytes, {requested} requested")]
    TxShort { requested: usize, staged: usize },
    #[error("payload of {len} bytes exceeds buffer of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },
    #[error("mailbox still referenced")]
    InUse,
}

impl From<MailboxError> for SpciError {
    fn from(value: MailboxError) -> Self {
        match value {
            MailboxError::AlreadyMapped
            | MailboxError::NotMapped
            | MailboxError::RxEmpty
            | MailboxError::InUse => SpciError::Denied,
            MailboxError::InvalidAddress(_)
            | MailboxError::Overlap
            | MailboxError::InvalidPageCount(_)
            | MailboxError::TxShort { .. }
            | MailboxError::TooLarge { .. } => SpciError::InvalidParameter,
            MailboxError::RxBusy | MailboxError::TxBusy => SpciError::Busy,
        }
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Payload staged in an RX buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RxPayload {
    /// Indirect message
    Message(Message),
    /// Memory region descriptor of a pending transaction
    Descriptor { handle: Handle, bytes: Vec<u8> },
    /// `PARTITION_INFO_GET` result
    PartitionInfo { count: u32, bytes: Vec<u8> },
}

impl RxPayload {
    /// Bytes as they appear in the buffer
    pub fn bytes(&self) -> &[u8] {
        match self {
            RxPayload::Message(msg) => &msg.payload,
            RxPayload::Descriptor { bytes, .. } | RxPayload::PartitionInfo { bytes, .. } => bytes,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum RxSlot {
    Empty,
    Full { payload: RxPayload, read: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TxSlot {
    Empty,
    Staged(Vec<u8>),
    InFlight { dest: PartitionId },
}

// ============================================================================
// Mailbox
// ============================================================================

/// One partition's RX/TX buffer pair
#[derive(Clone, Debug)]
pub struct Mailbox {
    pub rx_addr: u64,
    pub tx_addr: u64,
    pub page_count: u32,
    rx: RxSlot,
    tx: TxSlot,
}

impl Mailbox {
    fn new(rx_addr: u64, tx_addr: u64, page_count: u32) -> Self {
        Self {
            rx_addr,
            tx_addr,
            page_count,
            rx: RxSlot::Empty,
            tx: TxSlot::Empty,
        }
    }

    /// Size of each buffer in bytes
    pub fn capacity(&self) -> usize {
        self.page_count as usize * PAGE_SIZE as usize
    }

    pub fn rx_range(&self) -> PageRange {
        PageRange::new(self.rx_addr, self.page_count)
    }

    pub fn tx_range(&self) -> PageRange {
        PageRange::new(self.tx_addr, self.page_count)
    }

    pub fn rx_is_free(&self) -> bool {
        self.rx == RxSlot::Empty
    }

    /// Current RX payload, read or not.
    pub fn rx(&self) -> Option<&RxPayload> {
        match &self.rx {
            RxSlot::Full { payload, .. } => Some(payload),
            RxSlot::Empty => None,
        }
    }

    /// Message staged in RX that the owner has not read yet.
    pub fn unread_message(&self) -> Option<&Message> {
        match &self.rx {
            RxSlot::Full {
                payload: RxPayload::Message(msg),
                read: false,
            } => Some(msg),
            _ => None,
        }
    }

    pub fn has_unread_message(&self) -> bool {
        self.unread_message().is_some()
    }

    /// Write `payload` into RX.
    pub fn stage_rx(&mut self, payload: RxPayload) -> Result<(), MailboxError> {
        if !self.rx_is_free() {
            return Err(MailboxError::RxBusy);
        }
        let len = payload.bytes().len();
        if len > self.capacity() {
            return Err(MailboxError::TooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        self.rx = RxSlot::Full {
            payload,
            read: false,
        };
        Ok(())
    }

    /// Mark the unread message as read and return a copy of it.
    pub fn read_message(&mut self) -> Option<Message> {
        match &mut self.rx {
            RxSlot::Full {
                payload: RxPayload::Message(msg),
                read,
            } if !*read => {
                *read = true;
                Some(msg.clone())
            }
            _ => None,
        }
    }

    /// Owner is done with RX. Returns what was staged.
    pub fn release_rx(&mut self) -> Result<RxPayload, MailboxError> {
        match core::mem::replace(&mut self.rx, RxSlot::Empty) {
            RxSlot::Full { payload, .. } => Ok(payload),
            RxSlot::Empty => Err(MailboxError::RxEmpty),
        }
    }

    /// Drop the staged descriptor of `handle`, if it is still in RX.
    pub fn discard_descriptor(&mut self, handle: Handle) -> bool {
        let matches = matches!(
            &self.rx,
            RxSlot::Full { payload: RxPayload::Descriptor { handle: h, .. }, .. } if *h == handle
        );
        if matches {
            self.rx = RxSlot::Empty;
        }
        matches
    }

    /// Owner writes its TX buffer.
    pub fn stage_tx(&mut self, bytes: Vec<u8>) -> Result<(), MailboxError> {
        if self.tx_in_flight().is_some() {
            return Err(MailboxError::TxBusy);
        }
        if bytes.len() > self.capacity() {
            return Err(MailboxError::TooLarge {
                len: bytes.len(),
                capacity: self.capacity(),
            });
        }
        self.tx = TxSlot::Staged(bytes);
        Ok(())
    }

    /// Look at the first `length` bytes of TX without consuming them.
    pub fn peek_tx(&self, length: usize) -> Result<&[u8], MailboxError> {
        match &self.tx {
            TxSlot::InFlight { .. } => Err(MailboxError::TxBusy),
            TxSlot::Empty => Err(MailboxError::TxShort {
                requested: length,
                staged: 0,
            }),
            TxSlot::Staged(bytes) if bytes.len() < length => Err(MailboxError::TxShort {
                requested: length,
                staged: bytes.len(),
            }),
            TxSlot::Staged(bytes) => Ok(&bytes[..length]),
        }
    }

    /// Consume the first `length` bytes of TX. TX becomes empty.
    pub fn read_tx(&mut self, length: usize) -> Result<Vec<u8>, MailboxError> {
        let bytes = self.peek_tx(length)?.to_vec();
        self.tx = TxSlot::Empty;
        Ok(bytes)
    }

    /// Consume `length` bytes of TX for a message to `dest`; TX stays in
    /// flight until the message is read.
    pub fn send_tx(&mut self, length: usize, dest: PartitionId) -> Result<Vec<u8>, MailboxError> {
        let bytes = self.peek_tx(length)?.to_vec();
        self.tx = TxSlot::InFlight { dest };
        Ok(bytes)
    }

    /// Destination of the message still in flight from TX.
    pub fn tx_in_flight(&self) -> Option<PartitionId> {
        match self.tx {
            TxSlot::InFlight { dest } => Some(dest),
            _ => None,
        }
    }

    /// The in-flight message reached `dest`.
    pub fn complete_delivery(&mut self, dest: PartitionId) {
        if self.tx_in_flight() == Some(dest) {
            self.tx = TxSlot::Empty;
        }
    }
}

// ============================================================================
// Mailbox table
// ============================================================================

/// All mapped mailboxes, keyed by owner
#[derive(Clone, Debug)]
pub struct Mailboxes {
    boxes: BTreeMap<PartitionId, Mailbox>,
    max_pages: u32,
}

impl Mailboxes {
    pub fn new(max_pages: u32) -> Self {
        Self {
            boxes: BTreeMap::new(),
            max_pages,
        }
    }

    /// Bind `partition`'s RX/TX buffers.
    pub fn map(
        &mut self,
        partition: PartitionId,
        rx_addr: u64,
        tx_addr: u64,
        page_count: u32,
    ) -> Result<(), MailboxError> {
        self.check_map(partition, rx_addr, tx_addr, page_count)?;
        self.boxes
            .insert(partition, Mailbox::new(rx_addr, tx_addr, page_count));
        Ok(())
    }

    /// Everything `map` checks, without binding anything.
    pub fn check_map(
        &self,
        partition: PartitionId,
        rx_addr: u64,
        tx_addr: u64,
        page_count: u32,
    ) -> Result<(), MailboxError> {
        if self.boxes.contains_key(&partition) {
            return Err(MailboxError::AlreadyMapped);
        }
        for addr in [rx_addr, tx_addr] {
            if addr == 0 || addr % PAGE_SIZE != 0 {
                return Err(MailboxError::InvalidAddress(addr));
            }
        }
        if page_count == 0 || page_count > self.max_pages {
            return Err(MailboxError::InvalidPageCount(page_count));
        }
        let rx = PageRange::new(rx_addr, page_count);
        let tx = PageRange::new(tx_addr, page_count);
        if rx.overlaps(&tx) {
            return Err(MailboxError::Overlap);
        }
        Ok(())
    }

    /// Release `partition`'s buffers.
    ///
    /// Refused while RX holds a payload or a message sent from TX has not
    /// been read.
    pub fn unmap(&mut self, partition: PartitionId) -> Result<Mailbox, MailboxError> {
        let mailbox = self.boxes.get(&partition).ok_or(MailboxError::NotMapped)?;
        if !mailbox.rx_is_free() || mailbox.tx_in_flight().is_some() {
            return Err(MailboxError::InUse);
        }
        self.boxes.remove(&partition).ok_or(MailboxError::NotMapped)
    }

    pub fn get(&self, partition: PartitionId) -> Option<&Mailbox> {
        self.boxes.get(&partition)
    }

    pub fn get_mut(&mut self, partition: PartitionId) -> Option<&mut Mailbox> {
        self.boxes.get_mut(&partition)
    }

    /// Mailbox of `partition`, or `NotMapped`.
    pub fn require(&self, partition: PartitionId) -> Result<&Mailbox, MailboxError> {
        self.boxes.get(&partition).ok_or(MailboxError::NotMapped)
    }

    pub fn require_mut(&mut self, partition: PartitionId) -> Result<&mut Mailbox, MailboxError> {
        self.boxes.get_mut(&partition).ok_or(MailboxError::NotMapped)
    }

    pub fn is_mapped(&self, partition: PartitionId) -> bool {
        self.boxes.contains_key(&partition)
    }

    /// Write into `dest`'s RX buffer.
    pub fn stage_rx(&mut self, dest: PartitionId, payload: RxPayload) -> Result<(), MailboxError> {
        self.require_mut(dest)?.stage_rx(payload)
    }

    /// `partition` releases its RX buffer.
    pub fn release_rx(&mut self, partition: PartitionId) -> Result<RxPayload, MailboxError> {
        self.require_mut(partition)?.release_rx()
    }

    /// Owner writes its TX buffer.
    pub fn stage_tx(&mut self, partition: PartitionId, bytes: Vec<u8>) -> Result<(), MailboxError> {
        self.require_mut(partition)?.stage_tx(bytes)
    }

    /// True when `range` overlaps one of `partition`'s buffers.
    pub fn overlaps_buffers(&self, partition: PartitionId, range: &PageRange) -> bool {
        self.boxes.get(&partition).is_some_and(|mailbox| {
            mailbox.rx_range().overlaps(range) || mailbox.tx_range().overlaps(range)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionId, &Mailbox)> {
        self.boxes.iter()
    }
}
