//! Typed calls
//!
//! [`SpciCall::decode`] turns a raw register file into a call with typed
//! arguments. Both calling-convention widths decode to the same call; SMC32
//! calls only contribute the low 32 bits of each register.

use spci_abi::{
    AbiError, CallWidth, Function, FunctionId, MemAccess, PartitionId, Registers, SendAttributes,
    PARAM_MBZ, TARGET_INFO_MBZ,
};
use uuid::Uuid;

use crate::types::{Handle, TransactionKind};

/// A decoded SPCI call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpciCall {
    /// `SPCI_ERROR` issued as a call
    Error,
    /// `SPCI_SUCCESS` issued as a call
    Success,
    /// `SPCI_INTERRUPT` issued as a call
    Interrupt,
    Version {
        requested: u32,
    },
    Features {
        function_id: u32,
    },
    RxRelease,
    RxTxMap {
        tx_addr: u64,
        rx_addr: u64,
        page_count: u32,
    },
    RxTxUnmap {
        id: PartitionId,
    },
    PartitionInfoGet {
        uuid: Uuid,
    },
    IdGet,
    MsgPoll,
    MsgWait,
    MsgYield,
    MsgRun {
        target: PartitionId,
    },
    MsgSend {
        source: PartitionId,
        destination: PartitionId,
        length: u32,
        attributes: SendAttributes,
    },
    MsgSendDirectReq {
        source: PartitionId,
        destination: PartitionId,
        payload: [u64; 5],
    },
    MsgSendDirectResp {
        source: PartitionId,
        destination: PartitionId,
        payload: [u64; 5],
    },
    /// `MEM_DONATE`, `MEM_LEND` or `MEM_SHARE`
    MemTransfer {
        kind: TransactionKind,
        total_length: u32,
        fragment_length: u32,
    },
    MemRetrieveReq {
        handle: Handle,
        access: MemAccess,
    },
    MemRetrieveResp {
        handle: Handle,
    },
    MemRelinquish {
        handle: Handle,
    },
    MemReclaim {
        handle: Handle,
    },
}

/// Pack a UUID into `w1..w4`, four bytes per register.
pub fn uuid_to_words(uuid: &Uuid) -> [u32; 4] {
    let bytes = uuid.as_bytes();
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Inverse of [`uuid_to_words`].
pub fn uuid_from_words(words: [u32; 4]) -> Uuid {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Uuid::from_bytes(bytes)
}

/// `id << 16` with the low half must-be-zero.
fn target(regs: &Registers, index: usize) -> Result<PartitionId, AbiError> {
    let word = regs.w(index);
    if word & 0xFFFF != TARGET_INFO_MBZ {
        return Err(AbiError::NonZeroReserved(index));
    }
    Ok(PartitionId((word >> 16) as u16))
}

fn mbz(regs: &Registers, index: usize) -> Result<(), AbiError> {
    if regs.w(index) != PARAM_MBZ {
        return Err(AbiError::NonZeroReserved(index));
    }
    Ok(())
}

fn handle(regs: &Registers) -> Handle {
    Handle::from_words(regs.w(1), regs.w(2))
}

impl SpciCall {
    /// Decode the function id and arguments in `regs`.
    pub fn decode(regs: &Registers) -> Result<(FunctionId, SpciCall), AbiError> {
        let fid = FunctionId::decode(regs.fid())?;
        let x = |i: usize| fid.width.mask(regs.x(i));

        let call = match fid.function {
            Function::Error => SpciCall::Error,
            Function::Success => SpciCall::Success,
            Function::Interrupt => SpciCall::Interrupt,
            Function::Version => SpciCall::Version {
                requested: regs.w(1),
            },
            Function::Features => SpciCall::Features {
                function_id: regs.w(1),
            },
            Function::RxRelease => SpciCall::RxRelease,
            Function::RxTxMap => SpciCall::RxTxMap {
                tx_addr: x(1),
                rx_addr: x(2),
                page_count: regs.w(3),
            },
            Function::RxTxUnmap => SpciCall::RxTxUnmap {
                id: target(regs, 1)?,
            },
            Function::PartitionInfoGet => SpciCall::PartitionInfoGet {
                uuid: uuid_from_words([regs.w(1), regs.w(2), regs.w(3), regs.w(4)]),
            },
            Function::IdGet => SpciCall::IdGet,
            Function::MsgPoll => SpciCall::MsgPoll,
            Function::MsgWait => SpciCall::MsgWait,
            Function::MsgYield => SpciCall::MsgYield,
            Function::MsgRun => SpciCall::MsgRun {
                target: target(regs, 1)?,
            },
            Function::MsgSend => {
                let (source, destination) = PartitionId::unpack_pair(regs.w(1));
                mbz(regs, 2)?;
                SpciCall::MsgSend {
                    source,
                    destination,
                    length: regs.w(3),
                    attributes: SendAttributes::from_word(regs.w(4))?,
                }
            }
            Function::MsgSendDirectReq | Function::MsgSendDirectResp => {
                let (source, destination) = PartitionId::unpack_pair(regs.w(1));
                mbz(regs, 2)?;
                let payload = [x(3), x(4), x(5), x(6), x(7)];
                if fid.function == Function::MsgSendDirectReq {
                    SpciCall::MsgSendDirectReq {
                        source,
                        destination,
                        payload,
                    }
                } else {
                    SpciCall::MsgSendDirectResp {
                        source,
                        destination,
                        payload,
                    }
                }
            }
            Function::MemDonate | Function::MemLend | Function::MemShare => {
                let kind = match fid.function {
                    Function::MemDonate => TransactionKind::Donate,
                    Function::MemLend => TransactionKind::Lend,
                    _ => TransactionKind::Share,
                };
                // Descriptors only travel in TX; the buffer address and
                // page count fields are unused
                mbz(regs, 3)?;
                mbz(regs, 4)?;
                SpciCall::MemTransfer {
                    kind,
                    total_length: regs.w(1),
                    fragment_length: regs.w(2),
                }
            }
            Function::MemRetrieveReq => SpciCall::MemRetrieveReq {
                handle: handle(regs),
                access: MemAccess::from_word(regs.w(3))?,
            },
            Function::MemRetrieveResp => SpciCall::MemRetrieveResp {
                handle: handle(regs),
            },
            Function::MemRelinquish => SpciCall::MemRelinquish {
                handle: handle(regs),
            },
            Function::MemReclaim => SpciCall::MemReclaim {
                handle: handle(regs),
            },
        };
        Ok((fid, call))
    }

    /// The function this call invokes.
    pub fn function(&self) -> Function {
        match self {
            SpciCall::Error => Function::Error,
            SpciCall::Success => Function::Success,
            SpciCall::Interrupt => Function::Interrupt,
            SpciCall::Version { .. } => Function::Version,
            SpciCall::Features { .. } => Function::Features,
            SpciCall::RxRelease => Function::RxRelease,
            SpciCall::RxTxMap { .. } => Function::RxTxMap,
            SpciCall::RxTxUnmap { .. } => Function::RxTxUnmap,
            SpciCall::PartitionInfoGet { .. } => Function::PartitionInfoGet,
            SpciCall::IdGet => Function::IdGet,
            SpciCall::MsgPoll => Function::MsgPoll,
            SpciCall::MsgWait => Function::MsgWait,
            SpciCall::MsgYield => Function::MsgYield,
            SpciCall::MsgRun { .. } => Function::MsgRun,
            SpciCall::MsgSend { .. } => Function::MsgSend,
            SpciCall::MsgSendDirectReq { .. } => Function::MsgSendDirectReq,
            SpciCall::MsgSendDirectResp { .. } => Function::MsgSendDirectResp,
            SpciCall::MemTransfer { kind, .. } => match kind {
                TransactionKind::Donate => Function::MemDonate,
                TransactionKind::Lend => Function::MemLend,
                TransactionKind::Share => Function::MemShare,
            },
            SpciCall::MemRetrieveReq { .. } => Function::MemRetrieveReq,
            SpciCall::MemRetrieveResp { .. } => Function::MemRetrieveResp,
            SpciCall::MemRelinquish { .. } => Function::MemRelinquish,
            SpciCall::MemReclaim { .. } => Function::MemReclaim,
        }
    }

    /// Calls that cannot do anything without the caller's mailbox.
    pub fn needs_mailbox(&self) -> bool {
        matches!(
            self,
            SpciCall::MsgSend { .. }
                | SpciCall::MsgPoll
                | SpciCall::RxRelease
                | SpciCall::PartitionInfoGet { .. }
                | SpciCall::MemTransfer { .. }
        )
    }

    /// Encode as a partition would issue it.
    pub fn to_registers(&self, width: CallWidth) -> Registers {
        let mut args = [0u64; 7];
        let handle_args = |args: &mut [u64; 7], handle: &Handle| {
            args[0] = handle.lo() as u64;
            args[1] = handle.hi() as u64;
        };
        match self {
            SpciCall::Version { requested } => args[0] = *requested as u64,
            SpciCall::Features { function_id } => args[0] = *function_id as u64,
            SpciCall::RxTxMap {
                tx_addr,
                rx_addr,
                page_count,
            } => {
                args[0] = *tx_addr;
                args[1] = *rx_addr;
                args[2] = *page_count as u64;
            }
            SpciCall::RxTxUnmap { id } => args[0] = id.target_info() as u64,
            SpciCall::PartitionInfoGet { uuid } => {
                for (arg, word) in args.iter_mut().zip(uuid_to_words(uuid)) {
                    *arg = word as u64;
                }
            }
            SpciCall::MsgRun { target } => args[0] = target.target_info() as u64,
            SpciCall::MsgSend {
                source,
                destination,
                length,
                attributes,
            } => {
                args[0] = PartitionId::pack_pair(*source, *destination) as u64;
                args[2] = *length as u64;
                args[3] = attributes.to_word() as u64;
            }
            SpciCall::MsgSendDirectReq {
                source,
                destination,
                payload,
            }
            | SpciCall::MsgSendDirectResp {
                source,
                destination,
                payload,
            } => {
                args[0] = PartitionId::pack_pair(*source, *destination) as u64;
                args[2..].copy_from_slice(payload);
            }
            SpciCall::MemTransfer {
                total_length,
                fragment_length,
                ..
            } => {
                args[0] = *total_length as u64;
                args[1] = *fragment_length as u64;
            }
            SpciCall::MemRetrieveReq { handle, access } => {
                handle_args(&mut args, handle);
                args[2] = access.bits() as u64;
            }
            SpciCall::MemRetrieveResp { handle }
            | SpciCall::MemRelinquish { handle }
            | SpciCall::MemReclaim { handle } => handle_args(&mut args, handle),
            SpciCall::Error
            | SpciCall::Success
            | SpciCall::Interrupt
            | SpciCall::RxRelease
            | SpciCall::IdGet
            | SpciCall::MsgPoll
            | SpciCall::MsgWait
            | SpciCall::MsgYield => {}
        }
        let fid = FunctionId::new(self.function(), width);
        for arg in args.iter_mut() {
            *arg = width.mask(*arg);
        }
        Registers::call(fid.raw(), args)
    }
}
