//! Buffer Descriptor Table shared with the SIE's DMA engine.
//!
//! Each (endpoint, direction, bank) owns one descriptor: a control word and a
//! buffer address. Ownership of a descriptor passes to the SIE when OWN is set
//! and comes back when the SIE clears it on token completion. Software must not
//! touch a descriptor the SIE owns.
use core::sync::atomic::{compiler_fence, Ordering};

use bitfield::bitfield;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use vcell::VolatileCell;

use crate::endpoint::{Bank, Direction};
use crate::packet::PacketId;
use crate::EP_NUM_CNT;

pub const BDT_ENTRIES: usize = EP_NUM_CNT * 4;

bitfield! {
    /// Descriptor control word. Software writes the upper layout (KEEP..BDT_STALL),
    /// the SIE writes back the token PID into bits 5..2 on completion.
    pub struct BdControl(u32);
    impl Debug;
    pub own, set_own: 7;
    pub data1, set_data1: 6;
    pub keep, set_keep: 5;
    pub ninc, set_ninc: 4;
    pub dts, set_dts: 3;
    pub bdt_stall, set_bdt_stall: 2;
    pub u8, pid, _: 5, 2;
    pub u16, byte_count, set_byte_count: 25, 16;
}

/// Token PIDs the SIE reports in a retired descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum TokenPid {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

#[repr(C)]
pub struct BufferDescriptor {
    desc: VolatileCell<u32>,
    addr: VolatileCell<u32>,
}

impl BufferDescriptor {
    pub const fn new() -> BufferDescriptor {
        BufferDescriptor { desc: VolatileCell::new(0), addr: VolatileCell::new(0) }
    }

    /// Hands the slot to the SIE. The control word is written without OWN first
    /// so the SIE never sees a half-built descriptor.
    pub fn set(&self, addr: u32, count: usize, data1: bool) {
        self.addr.set(addr);
        let mut ctl = BdControl(0);
        ctl.set_byte_count(count as u16);
        ctl.set_data1(data1);
        ctl.set_dts(true);
        self.desc.set(ctl.0);
        compiler_fence(Ordering::SeqCst);
        ctl.set_own(true);
        self.desc.set(ctl.0);
    }

    pub fn clear(&self) { self.desc.set(0) }

    /// Makes the SIE answer the next token on this slot with STALL.
    pub fn stall(&self) {
        let mut ctl = self.control();
        ctl.set_bdt_stall(true);
        ctl.set_own(true);
        self.desc.set(ctl.0);
    }

    pub fn control(&self) -> BdControl { BdControl(self.desc.get()) }

    pub fn count(&self) -> usize { self.control().byte_count() as usize }

    pub fn pid(&self) -> Option<TokenPid> { TokenPid::from_u8(self.control().pid()) }

    pub fn owned_by_sie(&self) -> bool { self.control().own() }

    pub fn address(&self) -> u32 { self.addr.get() }

    /// Plays the SIE's part on token completion: writes back PID and byte count,
    /// drops OWN and keeps the DATA0/1 bit the slot was armed with.
    #[cfg(test)]
    pub(crate) fn complete(&self, pid: TokenPid, count: usize) {
        let mut ctl = BdControl(0);
        ctl.set_data1(self.control().data1());
        ctl.set_byte_count(count as u16);
        ctl.0 |= (pid as u32) << 2;
        self.desc.set(ctl.0);
    }
}

impl Default for BufferDescriptor {
    fn default() -> Self { Self::new() }
}

/// The table itself. The SIE requires 512-byte alignment; place it in a `static`
/// and hand the reference to [`crate::Usb::new`].
#[repr(C, align(512))]
pub struct BdTable {
    entries: [BufferDescriptor; BDT_ENTRIES],
}

// the table is only touched with the USB interrupt masked or from the ISR itself
unsafe impl Sync for BdTable {}

impl BdTable {
    pub const fn new() -> BdTable {
        const EMPTY: BufferDescriptor = BufferDescriptor::new();
        BdTable { entries: [EMPTY; BDT_ENTRIES] }
    }

    pub fn base_addr(&self) -> u32 { self as *const BdTable as usize as u32 }
}

impl Default for BdTable {
    fn default() -> Self { Self::new() }
}

/// Software view of the table: the hardware descriptors plus which packet each
/// armed slot holds. A packet is owned by at most one slot.
pub struct Bdt {
    table: &'static BdTable,
    owners: [Option<PacketId>; BDT_ENTRIES],
}

impl Bdt {
    pub fn new(table: &'static BdTable) -> Bdt {
        for entry in table.entries.iter() {
            entry.clear();
        }
        Bdt { table, owners: [None; BDT_ENTRIES] }
    }

    pub const fn index(num: u8, dir: Direction, bank: Bank) -> usize {
        ((num as usize) << 2) | ((dir as usize) << 1) | bank as usize
    }

    pub fn entry(&self, index: usize) -> &BufferDescriptor { &self.table.entries[index] }

    pub fn base_addr(&self) -> u32 { self.table.base_addr() }

    pub fn owner(&self, index: usize) -> Option<PacketId> { self.owners[index] }

    pub fn is_armed(&self, index: usize) -> bool { self.owners[index].is_some() }

    /// Arms `index` with packet `id`, whose buffer lives at `addr`.
    pub fn arm(&mut self, index: usize, id: PacketId, addr: u32, count: usize, data1: bool) {
        if let Some(old) = self.owners[index] {
            log::error!("bdt[{}] re-armed while holding {:?}", index, old);
        }
        self.owners[index] = Some(id);
        self.table.entries[index].set(addr, count, data1);
    }

    /// Re-hands the packet already held by `index` to the SIE with a new toggle.
    pub fn rearm(&mut self, index: usize, addr: u32, count: usize, data1: bool) {
        self.table.entries[index].set(addr, count, data1);
    }

    /// Takes the slot back from the SIE, returning the packet it held and the
    /// control word the SIE wrote back.
    pub fn retire(&mut self, index: usize) -> (Option<PacketId>, BdControl) {
        let entry = &self.table.entries[index];
        let ctl = entry.control();
        entry.clear();
        (self.owners[index].take(), ctl)
    }

    pub fn stall(&self, index: usize) { self.table.entries[index].stall() }

    /// Idles a slot that holds no packet.
    pub fn clear(&self, index: usize) { self.table.entries[index].clear() }
}
