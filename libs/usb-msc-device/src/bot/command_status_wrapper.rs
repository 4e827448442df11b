use byteorder::{ByteOrder, LittleEndian};

/// Signature that identifies this packet as CSW
pub const SIGNATURE: u32 = 0x53425355;
pub const LEN: usize = 13;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    /// The host answers this with reset recovery.
    PhaseError = 0x02,
}

/// Closes every command on the IN endpoint.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandStatusWrapper {
    /// Copied from the CBW.
    pub tag: u32,
    /// Difference between the length the CBW announced and what actually moved.
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn to_bytes(&self) -> [u8; LEN] {
        let mut b = [0u8; LEN];
        LittleEndian::write_u32(&mut b[0..4], SIGNATURE);
        LittleEndian::write_u32(&mut b[4..8], self.tag);
        LittleEndian::write_u32(&mut b[8..12], self.data_residue);
        b[12] = self.status as u8;
        b
    }
}
