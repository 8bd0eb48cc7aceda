//! Function identifiers
//!
//! The function number space is closed: every assigned number is a variant
//! of [`Function`], so a `match` over it is checked for exhaustiveness by the
//! compiler. Numbers inside the reserved range that are not assigned decode
//! to [`AbiError::UnassignedFunction`].

use core::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::AbiError;

// ============================================================================
// Bit layout
// ============================================================================

/// Bit 31: fast call
pub const FUNCID_TYPE_FAST: u32 = 1 << 31;
/// Bit 30: SMC64 calling convention
pub const FUNCID_CC_SMC64: u32 = 1 << 30;
/// Owning entity number shift
pub const FUNCID_OEN_SHIFT: u32 = 24;
/// Owning entity number mask (after shifting)
pub const FUNCID_OEN_MASK: u32 = 0x3F;
/// Standard secure service owning entity
pub const OEN_STD: u32 = 4;
/// Bits 23:16 are reserved
pub const FUNCID_RESERVED_MASK: u32 = 0x00FF_0000;
/// Function number mask
pub const FUNCID_NUM_MASK: u32 = 0xFFFF;

/// Lowest function number reserved for SPCI
pub const SPCI_FNUM_MIN_VALUE: u16 = 0x60;
/// Highest function number reserved for SPCI
pub const SPCI_FNUM_MAX_VALUE: u16 = 0x7F;

/// Register width of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallWidth {
    Smc32,
    Smc64,
}

impl CallWidth {
    fn from_fid(raw: u32) -> Self {
        if raw & FUNCID_CC_SMC64 == 0 {
            CallWidth::Smc32
        } else {
            CallWidth::Smc64
        }
    }

    /// Truncate an argument register to the width of the call.
    pub fn mask(self, value: u64) -> u64 {
        match self {
            CallWidth::Smc32 => value & 0xFFFF_FFFF,
            CallWidth::Smc64 => value,
        }
    }
}

// ============================================================================
// Function numbers
// ============================================================================

/// Every assigned SPCI function number.
#[derive(
    Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[num_enum(error_type(name = AbiError, constructor = AbiError::UnassignedFunction))]
#[repr(u16)]
pub enum Function {
    Error = 0x60,
    Success = 0x61,
    Interrupt = 0x62,
    Version = 0x63,
    Features = 0x64,
    RxRelease = 0x65,
    RxTxMap = 0x66,
    RxTxUnmap = 0x67,
    PartitionInfoGet = 0x68,
    IdGet = 0x69,
    MsgPoll = 0x6A,
    MsgWait = 0x6B,
    MsgYield = 0x6C,
    MsgRun = 0x6D,
    MsgSend = 0x6E,
    MsgSendDirectReq = 0x6F,
    MsgSendDirectResp = 0x70,
    MemDonate = 0x71,
    MemLend = 0x72,
    MemShare = 0x73,
    MemRetrieveReq = 0x74,
    MemRetrieveResp = 0x75,
    MemRelinquish = 0x76,
    MemReclaim = 0x77,
}

impl Function {
    /// All assigned functions in numeric order.
    pub const ALL: [Function; 24] = [
        Function::Error,
        Function::Success,
        Function::Interrupt,
        Function::Version,
        Function::Features,
        Function::RxRelease,
        Function::RxTxMap,
        Function::RxTxUnmap,
        Function::PartitionInfoGet,
        Function::IdGet,
        Function::MsgPoll,
        Function::MsgWait,
        Function::MsgYield,
        Function::MsgRun,
        Function::MsgSend,
        Function::MsgSendDirectReq,
        Function::MsgSendDirectResp,
        Function::MemDonate,
        Function::MemLend,
        Function::MemShare,
        Function::MemRetrieveReq,
        Function::MemRetrieveResp,
        Function::MemRelinquish,
        Function::MemReclaim,
    ];

    /// Functions that also have an SMC64 identifier.
    pub fn has_smc64(self) -> bool {
        matches!(
            self,
            Function::Success
                | Function::RxTxMap
                | Function::MsgSendDirectReq
                | Function::MsgSendDirectResp
                | Function::MemDonate
                | Function::MemLend
                | Function::MemShare
                | Function::MemRetrieveReq
        )
    }

    /// `ERROR`, `SUCCESS` and `INTERRUPT` are response codes, not requests.
    pub fn is_response_code(self) -> bool {
        matches!(
            self,
            Function::Error | Function::Success | Function::Interrupt
        )
    }

    /// Messaging calls (`MSG_*`).
    pub fn is_message(self) -> bool {
        matches!(
            self,
            Function::MsgPoll
                | Function::MsgWait
                | Function::MsgYield
                | Function::MsgRun
                | Function::MsgSend
                | Function::MsgSendDirectReq
                | Function::MsgSendDirectResp
        )
    }

    /// Memory management calls (`MEM_*`).
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            Function::MemDonate
                | Function::MemLend
                | Function::MemShare
                | Function::MemRetrieveReq
                | Function::MemRetrieveResp
                | Function::MemRelinquish
                | Function::MemReclaim
        )
    }

    /// Name as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Function::Error => "SPCI_ERROR",
            Function::Success => "SPCI_SUCCESS",
            Function::Interrupt => "SPCI_INTERRUPT",
            Function::Version => "SPCI_VERSION",
            Function::Features => "SPCI_FEATURES",
            Function::RxRelease => "SPCI_RX_RELEASE",
            Function::RxTxMap => "SPCI_RXTX_MAP",
            Function::RxTxUnmap => "SPCI_RXTX_UNMAP",
            Function::PartitionInfoGet => "SPCI_PARTITION_INFO_GET",
            Function::IdGet => "SPCI_ID_GET",
            Function::MsgPoll => "SPCI_MSG_POLL",
            Function::MsgWait => "SPCI_MSG_WAIT",
            Function::MsgYield => "SPCI_MSG_YIELD",
            Function::MsgRun => "SPCI_MSG_RUN",
            Function::MsgSend => "SPCI_MSG_SEND",
            Function::MsgSendDirectReq => "SPCI_MSG_SEND_DIRECT_REQ",
            Function::MsgSendDirectResp => "SPCI_MSG_SEND_DIRECT_RESP",
            Function::MemDonate => "SPCI_MEM_DONATE",
            Function::MemLend => "SPCI_MEM_LEND",
            Function::MemShare => "SPCI_MEM_SHARE",
            Function::MemRetrieveReq => "SPCI_MEM_RETRIEVE_REQ",
            Function::MemRetrieveResp => "SPCI_MEM_RETRIEVE_RESP",
            Function::MemRelinquish => "SPCI_MEM_RELINQUISH",
            Function::MemReclaim => "SPCI_MEM_RECLAIM",
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Decoded identifier
// ============================================================================

/// A decoded function identifier: which function, at which width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId {
    pub function: Function,
    pub width: CallWidth,
}

impl FunctionId {
    pub const fn new(function: Function, width: CallWidth) -> Self {
        Self { function, width }
    }

    /// SMC32 identifier for `function`.
    pub const fn smc32(function: Function) -> Self {
        Self::new(function, CallWidth::Smc32)
    }

    /// Decode a raw function identifier.
    ///
    /// The identifier must be a fast call owned by the standard secure
    /// service with the reserved bits clear and a function number in
    /// `0x60..=0x7F`. Both widths decode for every function.
    pub fn decode(raw: u32) -> Result<Self, AbiError> {
        if raw & FUNCID_TYPE_FAST == 0
            || (raw >> FUNCID_OEN_SHIFT) & FUNCID_OEN_MASK != OEN_STD
            || raw & FUNCID_RESERVED_MASK != 0
            || !is_spci_fid(raw)
        {
            return Err(AbiError::UnrecognisedCall(raw));
        }

        let function = Function::try_from((raw & FUNCID_NUM_MASK) as u16)?;
        Ok(Self {
            function,
            width: CallWidth::from_fid(raw),
        })
    }

    /// Encode back into the raw identifier.
    pub fn raw(self) -> u32 {
        spci_fid(self.width, self.function)
    }

    /// The identifier a response to this call should carry for `function`.
    ///
    /// Responses use SMC64 only when the request did and the response
    /// function defines an SMC64 identifier.
    pub fn response(self, function: Function) -> FunctionId {
        let width = match self.width {
            CallWidth::Smc64 if function.has_smc64() => CallWidth::Smc64,
            _ => CallWidth::Smc32,
        };
        FunctionId::new(function, width)
    }
}

impl TryFrom<u32> for FunctionId {
    type Error = AbiError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::decode(raw)
    }
}

impl From<FunctionId> for u32 {
    fn from(value: FunctionId) -> Self {
        value.raw()
    }
}

/// Build a fast-call standard-service identifier for `function`.
pub fn spci_fid(width: CallWidth, function: Function) -> u32 {
    let cc = match width {
        CallWidth::Smc32 => 0,
        CallWidth::Smc64 => FUNCID_CC_SMC64,
    };
    FUNCID_TYPE_FAST | cc | (OEN_STD << FUNCID_OEN_SHIFT) | u16::from(function) as u32
}

/// True when the function number of `raw` lies in the SPCI range.
///
/// Only the number is inspected, matching the range check of the service
/// header. Use [`FunctionId::decode`] for a full check.
pub fn is_spci_fid(raw: u32) -> bool {
    let num = (raw & FUNCID_NUM_MASK) as u16;
    (SPCI_FNUM_MIN_VALUE..=SPCI_FNUM_MAX_VALUE).contains(&num)
}
