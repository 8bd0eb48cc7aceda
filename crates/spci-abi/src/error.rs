//! Error codes and decode failures

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures while decoding raw register values.
///
/// These never reach a partition directly; they are converted into an
/// [`SpciError`] by the dispatcher.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("Unrecognised SPCI call {0:#010x}")]
    UnrecognisedCall(u32),
    #[error("Unassigned SPCI function number {0:#06x}")]
    UnassignedFunction(u16),
    #[error("Unrecognised SPCI error code {0}")]
    UnrecognisedErrorCode(i32),
    #[error("Invalid version word {0:#010x}")]
    InvalidVersion(u32),
    #[error("Invalid message send attributes {0:#x}")]
    InvalidSendAttributes(u32),
    #[error("Invalid memory access bits {0:#x}")]
    InvalidAccess(u32),
    #[error("Non-zero must-be-zero field in register w{0}")]
    NonZeroReserved(usize),
}

impl From<AbiError> for SpciError {
    fn from(value: AbiError) -> Self {
        match value {
            AbiError::UnrecognisedCall(_) | AbiError::UnassignedFunction(_) => {
                SpciError::NotSupported
            }
            AbiError::UnrecognisedErrorCode(_)
            | AbiError::InvalidVersion(_)
            | AbiError::InvalidSendAttributes(_)
            | AbiError::InvalidAccess(_)
            | AbiError::NonZeroReserved(_) => SpciError::InvalidParameter,
        }
    }
}

/// Error status codes carried by an `SPCI_ERROR` response.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Error,
    Hash,
    IntoPrimitive,
    PartialEq,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[num_enum(error_type(name = AbiError, constructor = AbiError::UnrecognisedErrorCode))]
#[repr(i32)]
pub enum SpciError {
    #[error("Not supported")]
    NotSupported = -1,
    #[error("Invalid parameter")]
    InvalidParameter = -2,
    #[error("No memory")]
    NoMemory = -3,
    #[error("Busy")]
    Busy = -4,
    #[error("Interrupted")]
    Interrupted = -5,
    #[error("Denied")]
    Denied = -6,
    #[error("Retry")]
    Retry = -7,
}

impl SpciError {
    /// The code as it is written to w2: 32-bit two's complement, zero extended.
    pub fn as_register(self) -> u64 {
        i32::from(self) as u32 as u64
    }

    /// Decode w2 of an error response.
    pub fn from_register(reg: u64) -> Result<Self, AbiError> {
        Self::try_from(reg as u32 as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(i32::from(SpciError::NotSupported), -1);
        assert_eq!(i32::from(SpciError::InvalidParameter), -2);
        assert_eq!(i32::from(SpciError::NoMemory), -3);
        assert_eq!(i32::from(SpciError::Busy), -4);
        assert_eq!(i32::from(SpciError::Interrupted), -5);
        assert_eq!(i32::from(SpciError::Denied), -6);
        assert_eq!(i32::from(SpciError::Retry), -7);
    }

    #[test]
    fn test_error_register_encoding() {
        assert_eq!(SpciError::Busy.as_register(), 0xFFFF_FFFC);
        assert_eq!(
            SpciError::from_register(0xFFFF_FFFA),
            Ok(SpciError::Denied)
        );
        assert_eq!(
            SpciError::from_register(0xFFFF_FFF0),
            Err(AbiError::UnrecognisedErrorCode(-16))
        );
    }

    #[test]
    fn test_abi_error_mapping() {
        assert_eq!(
            SpciError::from(AbiError::UnrecognisedCall(0x8400_0010)),
            SpciError::NotSupported
        );
        assert_eq!(
            SpciError::from(AbiError::UnassignedFunction(0x7A)),
            SpciError::NotSupported
        );
        assert_eq!(
            SpciError::from(AbiError::NonZeroReserved(3)),
            SpciError::InvalidParameter
        );
    }
}
