//! Message-send attribute word

use crate::error::AbiError;

pub const MSG_SEND_ATTRS_BLK_SHIFT: u32 = 0;
pub const MSG_SEND_ATTRS_BLK_MASK: u32 = 0x1;
/// Blocking send
pub const MSG_SEND_ATTRS_BLK: u32 = 0;
/// Non-blocking send
pub const MSG_SEND_ATTRS_BLK_NOT: u32 = 1;

/// Decoded `MSG_SEND` attributes.
///
/// A clear blocking bit means the send blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendAttributes {
    pub blocking: bool,
}

impl SendAttributes {
    pub const BLOCKING: SendAttributes = SendAttributes { blocking: true };
    pub const NON_BLOCKING: SendAttributes = SendAttributes { blocking: false };

    /// Decode an attribute word. Bits other than the blocking bit are MBZ.
    pub fn from_word(word: u32) -> Result<Self, AbiError> {
        if word & !(MSG_SEND_ATTRS_BLK_MASK << MSG_SEND_ATTRS_BLK_SHIFT) != 0 {
            return Err(AbiError::InvalidSendAttributes(word));
        }
        let blk = (word >> MSG_SEND_ATTRS_BLK_SHIFT) & MSG_SEND_ATTRS_BLK_MASK;
        Ok(Self {
            blocking: blk == MSG_SEND_ATTRS_BLK,
        })
    }

    pub fn to_word(self) -> u32 {
        let blk = if self.blocking {
            MSG_SEND_ATTRS_BLK
        } else {
            MSG_SEND_ATTRS_BLK_NOT
        };
        (blk & MSG_SEND_ATTRS_BLK_MASK) << MSG_SEND_ATTRS_BLK_SHIFT
    }
}
