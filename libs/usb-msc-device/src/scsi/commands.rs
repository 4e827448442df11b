use num_derive::FromPrimitive;

/// SCSI op codes served by this device
#[derive(Clone, Copy, Eq, PartialEq, Debug, FromPrimitive)]
pub enum OpCode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    ModeSense6 = 0x1A,
    ReadFormatCapacities = 0x23,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    ModeSelect10 = 0x55,
    ModeSense10 = 0x5A,
    ReportLuns = 0xA0,
}

/// CDB length implied by the op code's group bits.
pub fn cdb_len(opcode: u8) -> Option<usize> {
    match opcode {
        0x00..=0x1F => Some(6),
        0x20..=0x5F => Some(10),
        // reserved, then variable length
        0x60..=0x7F => None,
        0x80..=0x9F => Some(16),
        0xA0..=0xBF => Some(12),
        // vendor specific
        _ => None,
    }
}

/// How the data phase of the current command moves bytes.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Transfer {
    None,
    /// Device to host from the response buffer.
    Response,
    /// Host to device parameter data that is accepted and dropped.
    Parameters,
    ReadBlocks,
    WriteBlocks,
}
