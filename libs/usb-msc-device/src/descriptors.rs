//! Standard descriptors for a single-configuration, single-interface
//! mass-storage device.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use num_derive::FromPrimitive;

use crate::bus::{BULK_IN, BULK_OUT};
use crate::config::{Config, MAX_STRING_CHARS};
use crate::MAX_PKT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
}

pub const DEVICE_LEN: usize = 18;
pub const CONFIGURATION_LEN: usize = 9;
pub const INTERFACE_LEN: usize = 9;
pub const ENDPOINT_LEN: usize = 7;
/// Configuration, interface and both endpoint descriptors, as returned together.
pub const CONFIGURATION_TOTAL_LEN: usize = CONFIGURATION_LEN + INTERFACE_LEN + 2 * ENDPOINT_LEN;

pub const LANGID_EN_US: u16 = 0x0409;
/// String descriptor indices. Index 0 is the language ID table.
pub const STRING_MANUFACTURER: u8 = 1;
pub const STRING_PRODUCT: u8 = 2;
pub const STRING_SERIAL: u8 = 3;
pub const NUM_STRINGS: usize = 4;

const CLASS_MASS_STORAGE: u8 = 0x08;
const SUBCLASS_SCSI: u8 = 0x06;
const PROTOCOL_BULK_ONLY: u8 = 0x50;
const ATTR_RESERVED: u8 = 0x80;
const ATTR_SELF_POWERED: u8 = 0x40;
const ENDPOINT_BULK: u8 = 0x02;

type StringDescriptor = Vec<u8, { 2 + 2 * MAX_STRING_CHARS }>;

/// Descriptor bytes rendered once from a [`Config`].
pub struct Descriptors {
    device: [u8; DEVICE_LEN],
    configuration: [u8; CONFIGURATION_TOTAL_LEN],
    strings: [StringDescriptor; NUM_STRINGS],
}

impl Descriptors {
    pub fn new(config: &Config) -> Descriptors {
        let mut device = [0u8; DEVICE_LEN];
        device[0] = DEVICE_LEN as u8;
        device[1] = DescriptorType::Device as u8;
        LittleEndian::write_u16(&mut device[2..4], 0x0101);
        // class, subclass and protocol are defined per interface
        device[7] = MAX_PKT_SIZE as u8;
        LittleEndian::write_u16(&mut device[8..10], config.vendor_id);
        LittleEndian::write_u16(&mut device[10..12], config.product_id);
        LittleEndian::write_u16(&mut device[12..14], config.device_release);
        device[14] = STRING_MANUFACTURER;
        device[15] = STRING_PRODUCT;
        device[16] = STRING_SERIAL;
        device[17] = 1;

        let mut configuration = [0u8; CONFIGURATION_TOTAL_LEN];
        let c = &mut configuration[..CONFIGURATION_LEN];
        c[0] = CONFIGURATION_LEN as u8;
        c[1] = DescriptorType::Configuration as u8;
        LittleEndian::write_u16(&mut c[2..4], CONFIGURATION_TOTAL_LEN as u16);
        c[4] = 1;
        c[5] = 1;
        c[6] = 0;
        c[7] = ATTR_RESERVED | if config.self_powered { ATTR_SELF_POWERED } else { 0 };
        c[8] = (config.max_power_ma / 2) as u8;
        configuration[CONFIGURATION_LEN..CONFIGURATION_LEN + INTERFACE_LEN].copy_from_slice(&[
            INTERFACE_LEN as u8,
            DescriptorType::Interface as u8,
            0,
            0,
            2,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            PROTOCOL_BULK_ONLY,
            0,
        ]);
        let mut offset = CONFIGURATION_LEN + INTERFACE_LEN;
        for ep in [BULK_IN, BULK_OUT] {
            let e = &mut configuration[offset..offset + ENDPOINT_LEN];
            e[0] = ENDPOINT_LEN as u8;
            e[1] = DescriptorType::Endpoint as u8;
            e[2] = ep.to_byte();
            e[3] = ENDPOINT_BULK;
            LittleEndian::write_u16(&mut e[4..6], MAX_PKT_SIZE as u16);
            e[6] = 0;
            offset += ENDPOINT_LEN;
        }

        let mut langid = StringDescriptor::new();
        langid.extend_from_slice(&[4, DescriptorType::String as u8]).ok();
        langid.extend_from_slice(&LANGID_EN_US.to_le_bytes()).ok();

        Descriptors {
            device,
            configuration,
            strings: [
                langid,
                string_descriptor(config.manufacturer),
                string_descriptor(config.product),
                string_descriptor(config.serial),
            ],
        }
    }

    pub fn device(&self) -> &[u8] { &self.device }

    pub fn configuration(&self) -> &[u8] { &self.configuration }

    pub fn string(&self, index: u8) -> Option<&[u8]> { self.strings.get(index as usize).map(|s| s.as_slice()) }
}

/// UTF-16LE string descriptor. Input is ASCII, checked by `Config::validate`, and
/// is cut at `MAX_STRING_CHARS`.
fn string_descriptor(s: &str) -> StringDescriptor {
    let mut d = StringDescriptor::new();
    let chars = s.len().min(MAX_STRING_CHARS);
    d.push((2 + 2 * chars) as u8).ok();
    d.push(DescriptorType::String as u8).ok();
    for b in s.bytes().take(chars) {
        d.extend_from_slice(&[b, 0]).ok();
    }
    d
}
