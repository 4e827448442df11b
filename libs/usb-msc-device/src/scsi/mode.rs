//! Mode parameter pages for Mode Sense / Mode Select.
use byteorder::{BigEndian, ByteOrder};

pub const PAGE_READ_WRITE_ERROR_RECOVERY: u8 = 0x01;
pub const PAGE_FLEXIBLE_DISK: u8 = 0x05;
pub const PAGE_CACHING: u8 = 0x08;
pub const PAGE_INFORMATIONAL_EXCEPTIONS: u8 = 0x1C;
pub const PAGE_ALL: u8 = 0x3F;

const BLOCK_DESCRIPTOR_LEN: usize = 8;
const TRANSFER_RATE_KBITS: u16 = 0x03E8;

/// Page control field of Mode Sense byte 2.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PageControl {
    Current = 0,
    Changeable = 1,
    Default = 2,
    Saved = 3,
}

impl PageControl {
    pub fn from_cdb(byte2: u8) -> PageControl {
        match byte2 >> 6 {
            0 => PageControl::Current,
            1 => PageControl::Changeable,
            2 => PageControl::Default,
            _ => PageControl::Saved,
        }
    }
}

/// Medium geometry and tuning reported through the mode pages.
#[derive(Clone, Copy, Debug)]
pub struct ModeParams {
    pub blocks: u32,
    pub block_len: u32,
    pub read_retries: u8,
    pub write_retries: u8,
}

fn page(code: u8, params: &ModeParams, out: &mut [u8]) -> usize {
    let len = match code {
        PAGE_READ_WRITE_ERROR_RECOVERY => 12,
        PAGE_FLEXIBLE_DISK => 32,
        PAGE_CACHING => 20,
        _ => 12,
    };
    out[..len].fill(0);
    out[0] = code;
    out[1] = (len - 2) as u8;
    match code {
        PAGE_READ_WRITE_ERROR_RECOVERY => {
            out[3] = params.read_retries;
            out[8] = params.write_retries;
        }
        PAGE_FLEXIBLE_DISK => {
            BigEndian::write_u16(&mut out[2..4], TRANSFER_RATE_KBITS);
            BigEndian::write_u16(&mut out[6..8], params.block_len as u16);
        }
        // caching disabled, exception reporting off
        _ => {}
    }
    len
}

/// Renders a Mode Sense response. Returns `None` for unknown pages.
pub fn mode_sense(out: &mut [u8], ten: bool, dbd: bool, code: u8, params: &ModeParams) -> Option<usize> {
    let header = if ten { 8 } else { 4 };
    let bdl = if dbd { 0 } else { BLOCK_DESCRIPTOR_LEN };
    let mut len = header;
    if bdl != 0 {
        BigEndian::write_u32(&mut out[len..len + 4], params.blocks);
        BigEndian::write_u32(&mut out[len + 4..len + 8], params.block_len);
        len += bdl;
    }
    match code {
        PAGE_READ_WRITE_ERROR_RECOVERY | PAGE_FLEXIBLE_DISK | PAGE_CACHING | PAGE_INFORMATIONAL_EXCEPTIONS => {
            len += page(code, params, &mut out[len..]);
        }
        PAGE_ALL => {
            len += page(PAGE_CACHING, params, &mut out[len..]);
            len += page(PAGE_INFORMATIONAL_EXCEPTIONS, params, &mut out[len..]);
        }
        _ => return None,
    }
    if ten {
        out[..header].fill(0);
        BigEndian::write_u16(&mut out[0..2], (len - 2) as u16);
        BigEndian::write_u16(&mut out[6..8], bdl as u16);
    } else {
        out[..header].copy_from_slice(&[(len - 1) as u8, 0, 0, bdl as u8]);
    }
    Some(len)
}
