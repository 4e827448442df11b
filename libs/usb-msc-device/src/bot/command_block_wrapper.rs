use byteorder::{ByteOrder, LittleEndian};

use crate::endpoint::Direction;

/// Signature that identifies this packet as CBW
pub const SIGNATURE: u32 = 0x43425355;
/// A CBW is always exactly this long.
pub const LEN: usize = 31;

const MAX_CB_LEN: usize = 16;

/// A wrapper that identifies a command sent from the host to the device on the
/// OUT endpoint. Describes the data transfer IN or OUT that should happen
/// immediately after this wrapper is received.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandBlockWrapper {
    /// Echoed back in the CSW so the host can pair them up.
    pub tag: u32,
    /// Bytes the host expects to move during the data phase. Zero means the CSW
    /// follows immediately.
    pub data_transfer_length: u32,
    pub direction: Direction,
    pub lun: u8,
    /// Valid bytes in `block`.
    pub block_len: u8,
    pub block: [u8; MAX_CB_LEN],
}

impl CommandBlockWrapper {
    /// Decodes a received packet. Anything that is not a meaningful CBW (wrong
    /// length, bad signature, CB length outside 1..=16) gives `None`.
    pub fn parse(buf: &[u8]) -> Option<CommandBlockWrapper> {
        if buf.len() != LEN || LittleEndian::read_u32(&buf[0..4]) != SIGNATURE {
            return None;
        }
        let block_len = buf[14] & 0x1F;
        if block_len == 0 || block_len as usize > MAX_CB_LEN {
            return None;
        }
        let mut block = [0u8; MAX_CB_LEN];
        block.copy_from_slice(&buf[15..31]);
        Some(CommandBlockWrapper {
            tag: LittleEndian::read_u32(&buf[4..8]),
            data_transfer_length: LittleEndian::read_u32(&buf[8..12]),
            direction: if buf[12] & 0x80 != 0 { Direction::In } else { Direction::Out },
            lun: buf[13] & 0x0F,
            block_len,
            block,
        })
    }

    /// The command block proper.
    pub fn command(&self) -> &[u8] { &self.block[..self.block_len as usize] }
}
