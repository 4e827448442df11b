//! USB mass-storage device stack for the Kinetis USB-OTG serial interface engine.
//!
//! The device enumerates with one configuration holding one Bulk-Only Transport
//! interface (SCSI transparent command set) backed by a [`BlockDevice`].
//!
//! Two execution contexts touch the stack:
//! 1. [`Usb::isr`] runs from the USB interrupt. It retires finished buffer
//!    descriptors, recycles packets and tracks bus state.
//! 2. [`Usb::process`] runs from the main loop. It masks the USB interrupt, advances
//!    the control pipe and then the Bulk-Only interface, and unmasks it again.
//!
//! Nothing blocks. Work that cannot complete immediately leaves state behind for
//! the next `process()` call.
#![cfg_attr(target_os = "none", no_std)]

pub mod bdt;
pub mod block_device;
pub mod bot;
pub mod bus;
pub mod config;
pub mod control;
pub mod descriptors;
pub mod endpoint;
pub mod error;
pub mod hw;
pub mod packet;
pub mod ram_disk;
pub mod scsi;
pub mod usb;

#[cfg(test)]
mod sim;

pub use bdt::BdTable;
pub use block_device::{BlockDevice, StreamDirection, StreamHandle};
pub use config::Config;
pub use error::{BlockDeviceError, Error};
pub use hw::{InterruptLine, KinetisSie, Reg, Sie, SystemClock};
pub use packet::{Packet, PacketStorage};
pub use ram_disk::RamDisk;
pub use usb::{DeviceState, Usb};

/// Max packet size for every endpoint, control included.
pub const MAX_PKT_SIZE: usize = 64;
/// Packets in the shared pool.
pub const NUM_PACKETS: usize = 32;
/// Endpoint numbers in use: 0 (control) and 1 (bulk in + bulk out).
pub const EP_NUM_CNT: usize = 2;
/// Highest logical unit number reported through Get Max LUN.
pub const MAX_LUN: u8 = 0;

mod logging {
    pub use log::trace as trace_usb;

    #[cfg(feature = "trace-bot")]
    pub use log::debug as trace_bot;
    #[cfg(not(feature = "trace-bot"))]
    pub use log::trace as trace_bot;

    #[cfg(feature = "trace-scsi")]
    pub use log::debug as trace_scsi;
    #[cfg(not(feature = "trace-scsi"))]
    pub use log::trace as trace_scsi;
}
