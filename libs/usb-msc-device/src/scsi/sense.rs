//! Fixed-format sense data (SPC-4 4.5.3).
use byteorder::{BigEndian, ByteOrder};

pub const SENSE_LEN: usize = 18;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
}

/// Additional sense codes this device reports.
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const PARAMETER_LIST_LENGTH_ERROR: u8 = 0x1A;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const SAVING_PARAMETERS_NOT_SUPPORTED: u8 = 0x39;
}

/// One latched sense record.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
    /// INFORMATION field; sets the VALID bit when present.
    pub information: Option<u32>,
    pub sks: [u8; 3],
}

impl Sense {
    /// The record reported when nothing went wrong.
    pub const fn no_sense() -> Sense {
        Sense { key: SenseKey::NoSense, asc: asc::NO_ADDITIONAL_SENSE, ascq: 0, information: None, sks: [0x80, 0, 0] }
    }

    const fn illegal(asc: u8, sks: [u8; 3]) -> Sense {
        Sense { key: SenseKey::IllegalRequest, asc, ascq: 0, information: None, sks }
    }

    /// Sense-key specific field pointer into the CDB (`cd` set) or the parameter
    /// list. `bit` is the offending bit within the byte, if known.
    pub fn field_pointer(cd: bool, byte: u16, bit: Option<u8>) -> [u8; 3] {
        let mut sks = [0x80 | (cd as u8) << 6, 0, 0];
        if let Some(bit) = bit {
            sks[0] |= 0x08 | (bit & 0x7);
        }
        BigEndian::write_u16(&mut sks[1..3], byte);
        sks
    }

    /// Sense-key specific actual retry count or progress indication.
    pub fn count(value: u16) -> [u8; 3] {
        let mut sks = [0x80, 0, 0];
        BigEndian::write_u16(&mut sks[1..3], value);
        sks
    }

    pub fn invalid_command() -> Sense {
        Sense::illegal(asc::INVALID_COMMAND_OPERATION_CODE, Sense::field_pointer(true, 0, Some(7)))
    }

    pub fn invalid_field(byte: u16) -> Sense {
        Sense::illegal(asc::INVALID_FIELD_IN_CDB, Sense::field_pointer(true, byte, None))
    }

    pub fn invalid_bit_field(byte: u16, bit: u8) -> Sense {
        Sense::illegal(asc::INVALID_FIELD_IN_CDB, Sense::field_pointer(true, byte, Some(bit)))
    }

    /// `lba`..`lba + len` does not fit a medium of `blocks` blocks. Points at the
    /// LBA field when the start is already past the end, otherwise at the length.
    pub fn invalid_lba(lba: u32, blocks: u32) -> Sense {
        let byte = if lba > blocks { 2 } else { 7 };
        let mut sense = Sense::illegal(asc::LBA_OUT_OF_RANGE, Sense::field_pointer(true, byte, None));
        sense.information = Some(blocks.saturating_sub(1));
        sense
    }

    pub fn parameter_list_length() -> Sense {
        Sense::illegal(asc::PARAMETER_LIST_LENGTH_ERROR, Sense::field_pointer(true, 0, None))
    }

    pub fn saving_not_supported() -> Sense {
        Sense::illegal(asc::SAVING_PARAMETERS_NOT_SUPPORTED, Sense::field_pointer(true, 2, Some(7)))
    }

    pub fn lun_not_supported() -> Sense { Sense::illegal(asc::LOGICAL_UNIT_NOT_SUPPORTED, [0, 0, 0]) }

    pub fn read_error(lba: u32, retries: u16) -> Sense {
        Sense {
            key: SenseKey::MediumError,
            asc: asc::UNRECOVERED_READ_ERROR,
            ascq: 0,
            information: Some(lba),
            sks: Sense::count(retries),
        }
    }

    pub fn write_error(lba: u32, retries: u16) -> Sense {
        Sense {
            key: SenseKey::MediumError,
            asc: asc::WRITE_ERROR,
            ascq: 0,
            information: Some(lba),
            sks: Sense::count(retries),
        }
    }

    pub fn to_bytes(&self) -> [u8; SENSE_LEN] {
        let mut b = [0u8; SENSE_LEN];
        b[0] = 0x70 | if self.information.is_some() { 0x80 } else { 0 };
        b[2] = self.key as u8;
        BigEndian::write_u32(&mut b[3..7], self.information.unwrap_or(0));
        b[7] = (SENSE_LEN - 8) as u8;
        b[12] = self.asc;
        b[13] = self.ascq;
        b[15..18].copy_from_slice(&self.sks);
        b
    }
}

impl Default for Sense {
    fn default() -> Self { Sense::no_sense() }
}
