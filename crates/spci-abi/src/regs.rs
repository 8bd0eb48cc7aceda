//! Register file and response encoding

use crate::error::SpciError;
use crate::fid::{spci_fid, CallWidth, Function, FunctionId};
use crate::version::Version;
use crate::PartitionId;

/// The eight argument/result registers `x0..x7` of a call.
///
/// `x0` carries the function identifier on entry and the response code on
/// exit. SMC32 calls only use the low 32 bits (`w`) of each register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers(pub [u64; 8]);

impl Registers {
    /// Build the registers of a call.
    pub fn call(fid: u32, args: [u64; 7]) -> Self {
        let mut regs = [0u64; 8];
        regs[0] = fid as u64;
        regs[1..].copy_from_slice(&args);
        Self(regs)
    }

    /// Function identifier in `w0`.
    pub fn fid(&self) -> u32 {
        self.0[0] as u32
    }

    /// Full 64-bit register `x{index}`.
    pub fn x(&self, index: usize) -> u64 {
        self.0[index]
    }

    /// Low 32 bits of register `x{index}`.
    pub fn w(&self, index: usize) -> u32 {
        self.0[index] as u32
    }
}

/// What the monitor writes back to a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    /// `SPCI_SUCCESS`: target info in w1, results in x2..x5
    Success {
        width: CallWidth,
        target: u32,
        results: [u64; 4],
    },
    /// `SPCI_ERROR`: code in w2, detail (interrupt id when interrupted) in w3
    Error { code: SpciError, detail: u32 },
    /// `SPCI_INTERRUPT`: target info in w1, interrupt id in w2
    Interrupt {
        target: PartitionId,
        interrupt_id: u32,
    },
    /// Reply to `SPCI_VERSION`: the bare version word in w0
    Version(Version),
    /// A function-coded response carrying its own arguments, such as a
    /// delivered `MSG_SEND` or a direct message.
    Call { fid: FunctionId, args: [u64; 7] },
}

impl Response {
    /// Plain SMC32 success with no results.
    pub fn success() -> Self {
        Self::success_with(CallWidth::Smc32, [0; 4])
    }

    pub fn success_with(width: CallWidth, results: [u64; 4]) -> Self {
        Response::Success {
            width,
            target: 0,
            results,
        }
    }

    pub fn error(code: SpciError) -> Self {
        Response::Error { code, detail: 0 }
    }

    /// The error code, if this is an error response.
    pub fn error_code(&self) -> Option<SpciError> {
        match self {
            Response::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    /// Encode into the register file returned to the partition.
    pub fn into_registers(self) -> Registers {
        let mut regs = [0u64; 8];
        match self {
            Response::Success {
                width,
                target,
                results,
            } => {
                regs[0] = spci_fid(width, Function::Success) as u64;
                regs[1] = target as u64;
                for (i, value) in results.iter().enumerate() {
                    regs[2 + i] = width.mask(*value);
                }
            }
            Response::Error { code, detail } => {
                regs[0] = spci_fid(CallWidth::Smc32, Function::Error) as u64;
                regs[2] = code.as_register();
                regs[3] = detail as u64;
            }
            Response::Interrupt {
                target,
                interrupt_id,
            } => {
                regs[0] = spci_fid(CallWidth::Smc32, Function::Interrupt) as u64;
                regs[1] = target.target_info() as u64;
                regs[2] = interrupt_id as u64;
            }
            Response::Version(version) => {
                regs[0] = version.to_word() as u64;
            }
            Response::Call { fid, args } => {
                regs[0] = fid.raw() as u64;
                for (i, value) in args.iter().enumerate() {
                    regs[1 + i] = fid.width.mask(*value);
                }
            }
        }
        Registers(regs)
    }
}

impl From<SpciError> for Response {
    fn from(code: SpciError) -> Self {
        Response::error(code)
    }
}
