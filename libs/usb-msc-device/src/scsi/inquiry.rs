//! Standard Inquiry data and the Vital Product Data pages.
use crate::config::Config;

pub const STANDARD_LEN: usize = 36;

pub const VPD_SUPPORTED_PAGES: u8 = 0x00;
pub const VPD_UNIT_SERIAL_NUMBER: u8 = 0x80;
pub const VPD_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xB1;

const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;
const REMOVABLE: u8 = 0x80;
const VERSION_SPC2: u8 = 0x04;
const RESPONSE_DATA_FORMAT: u8 = 0x02;
const NON_ROTATING_MEDIUM: u16 = 0x0001;
const PRODUCT_TYPE_SD: u8 = 0x05;
const FORM_FACTOR_UNDER_1_8_INCH: u8 = 0x05;

/// Space-padded identification strings, rendered once from the [`Config`].
pub struct Identity {
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
    serial: [u8; 16],
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let len = s.len().min(N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

impl Identity {
    pub fn new(config: &Config) -> Identity {
        Identity {
            vendor: padded(config.inquiry_vendor),
            product: padded(config.inquiry_product),
            revision: padded(config.inquiry_revision),
            serial: padded(config.serial),
        }
    }

    /// Standard Inquiry data. `out` must hold [`STANDARD_LEN`] bytes.
    pub fn standard(&self, out: &mut [u8]) -> usize {
        out[..8].copy_from_slice(&[
            PERIPHERAL_DIRECT_ACCESS,
            REMOVABLE,
            VERSION_SPC2,
            RESPONSE_DATA_FORMAT,
            (STANDARD_LEN - 5) as u8,
            0,
            0,
            0,
        ]);
        out[8..16].copy_from_slice(&self.vendor);
        out[16..32].copy_from_slice(&self.product);
        out[32..36].copy_from_slice(&self.revision);
        STANDARD_LEN
    }

    /// Renders VPD page `page` into `out`; `None` for pages this device lacks.
    pub fn vpd(&self, page: u8, out: &mut [u8]) -> Option<usize> {
        match page {
            VPD_SUPPORTED_PAGES => {
                let pages = [VPD_SUPPORTED_PAGES, VPD_UNIT_SERIAL_NUMBER, VPD_BLOCK_DEVICE_CHARACTERISTICS];
                out[..4].copy_from_slice(&[PERIPHERAL_DIRECT_ACCESS, page, 0, pages.len() as u8]);
                out[4..4 + pages.len()].copy_from_slice(&pages);
                Some(4 + pages.len())
            }
            VPD_UNIT_SERIAL_NUMBER => {
                out[..4].copy_from_slice(&[PERIPHERAL_DIRECT_ACCESS, page, 0, self.serial.len() as u8]);
                out[4..4 + self.serial.len()].copy_from_slice(&self.serial);
                Some(4 + self.serial.len())
            }
            VPD_BLOCK_DEVICE_CHARACTERISTICS => {
                let len = 64;
                out[..len].fill(0);
                out[..4].copy_from_slice(&[PERIPHERAL_DIRECT_ACCESS, page, 0, (len - 4) as u8]);
                out[4..6].copy_from_slice(&NON_ROTATING_MEDIUM.to_be_bytes());
                out[6] = PRODUCT_TYPE_SD;
                out[7] = FORM_FACTOR_UNDER_1_8_INCH;
                Some(len)
            }
            _ => None,
        }
    }
}
