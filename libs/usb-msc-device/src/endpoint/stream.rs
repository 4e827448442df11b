use heapless::Deque;

use super::{update_endpt, Bank, Direction, Drained, EndpointAddress, Pipe};
use crate::bdt::Bdt;
use crate::hw::Sie;
use crate::packet::{PacketId, PacketPool};
use crate::{MAX_PKT_SIZE, NUM_PACKETS};

/// Filled OUT packets kept before the endpoint stops re-arming its slots.
const RX_HIGH_WATER: usize = 8;
/// IN packets that may wait for a free slot before `can_send()` turns false.
const TX_PENDING_LIMIT: usize = 2;

/// Bulk OUT endpoint. Both banks are kept armed with empty packets; filled packets
/// queue up in arrival order until the interface pops them.
pub struct StreamOut {
    addr: EndpointAddress,
    enabled: bool,
    stalled: bool,
    /// Bank the SIE completes next. Survives disable/enable, like the SIE's own
    /// ping-pong pointer; only a bus reset (ODDRST) returns it to Even.
    hw_bank: Bank,
    /// DATA0/1 expected in `hw_bank`.
    toggle: bool,
    rx: Deque<PacketId, NUM_PACKETS>,
}

impl StreamOut {
    pub const fn new(num: u8) -> StreamOut {
        StreamOut {
            addr: EndpointAddress::new(num, Direction::Out),
            enabled: false,
            stalled: false,
            hw_bank: Bank::Even,
            toggle: false,
            rx: Deque::new(),
        }
    }

    fn slot(&self, bank: Bank) -> usize { Bdt::index(self.addr.num, Direction::Out, bank) }

    fn toggle_for(&self, bank: Bank) -> bool { if bank == self.hw_bank { self.toggle } else { !self.toggle } }

    fn wants_packet(&self, bdt: &Bdt, bank: Bank) -> bool {
        self.enabled && !bdt.is_armed(self.slot(bank)) && self.rx.len() < RX_HIGH_WATER
    }

    fn arm_with(&mut self, bdt: &mut Bdt, bank: Bank, id: PacketId, addr: u32) {
        let slot = self.slot(bank);
        bdt.arm(slot, id, addr, MAX_PKT_SIZE, self.toggle_for(bank));
        if self.stalled && bank == self.hw_bank {
            bdt.stall(slot);
        }
    }

    fn arm(&mut self, bdt: &mut Bdt, pool: &mut PacketPool, bank: Bank) {
        if !self.wants_packet(bdt, bank) {
            return;
        }
        if let Some(id) = pool.acquire_for(self.addr) {
            let addr = pool.dma_addr(id);
            self.arm_with(bdt, bank, id, addr);
        }
    }

    /// Arms every idle slot, registering demand with the pool if it is dry.
    pub fn refill(&mut self, bdt: &mut Bdt, pool: &mut PacketPool) {
        self.arm(bdt, pool, self.hw_bank);
        self.arm(bdt, pool, self.hw_bank.other());
    }

    /// Next filled packet, oldest first. Ownership passes to the caller.
    pub fn pop(&mut self) -> Option<PacketId> { self.rx.pop_front() }

    pub fn pending(&self) -> usize { self.rx.len() }

    /// Forgets the ping-pong position after the SIE's BDT pointers were reset.
    pub fn reset_banks(&mut self) { self.hw_bank = Bank::Even }
}

impl Pipe for StreamOut {
    fn address(&self) -> EndpointAddress { self.addr }

    fn enable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &mut PacketPool) {
        self.enabled = true;
        self.stalled = false;
        self.toggle = false;
        update_endpt(sie, self.addr.num, |e| e.set_eprxen(true));
        self.refill(bdt, pool);
    }

    fn disable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &mut PacketPool, drained: &mut Drained) {
        self.enabled = false;
        self.stalled = false;
        update_endpt(sie, self.addr.num, |e| e.set_eprxen(false));
        for bank in [Bank::Even, Bank::Odd] {
            if let (Some(id), _) = bdt.retire(self.slot(bank)) {
                drained.push(id).ok();
            }
        }
        while let Some(id) = self.rx.pop_front() {
            drained.push(id).ok();
        }
        pool.cancel(self.addr);
    }

    fn isr(&mut self, bdt: &mut Bdt, pool: &mut PacketPool, bank: Bank) -> Option<PacketId> {
        let (id, ctl) = bdt.retire(self.slot(bank));
        let Some(id) = id else {
            log::warn!("{:?}: completion on idle {:?} slot", self.addr, bank);
            return None;
        };
        if bank != self.hw_bank {
            log::warn!("{:?}: expected {:?} completion, got {:?}", self.addr, self.hw_bank, bank);
        }
        self.hw_bank = bank.other();
        self.toggle = !ctl.data1();
        pool.packet_mut(id).count = ctl.byte_count() as usize;
        if !self.enabled {
            return Some(id);
        }
        if let Err(id) = self.rx.push_back(id) {
            return Some(id);
        }
        self.arm(bdt, pool, bank);
        None
    }

    fn give(&mut self, bdt: &mut Bdt, id: PacketId, addr: u32) -> bool {
        for bank in [self.hw_bank, self.hw_bank.other()] {
            if self.wants_packet(bdt, bank) {
                self.arm_with(bdt, bank, id, addr);
                return true;
            }
        }
        false
    }

    fn stall(&mut self, bdt: &mut Bdt) {
        self.stalled = true;
        bdt.stall(self.slot(self.hw_bank));
    }

    fn unstall(&mut self, bdt: &mut Bdt, pool: &mut PacketPool) {
        self.stalled = false;
        self.toggle = false;
        for bank in [Bank::Even, Bank::Odd] {
            let slot = self.slot(bank);
            if bdt.is_armed(slot) {
                let addr = bdt.entry(slot).address();
                bdt.rearm(slot, addr, MAX_PKT_SIZE, self.toggle_for(bank));
            } else {
                bdt.clear(slot);
            }
        }
        self.refill(bdt, pool);
    }

    fn stalled(&self) -> bool { self.stalled }
}

/// Bulk IN endpoint. Packets queue in order and are armed into the two banks with
/// alternating DATA0/1; each one goes back to the pool once the host has it.
pub struct StreamIn {
    addr: EndpointAddress,
    enabled: bool,
    stalled: bool,
    hw_bank: Bank,
    toggle: bool,
    tx: Deque<PacketId, 4>,
}

impl StreamIn {
    pub const fn new(num: u8) -> StreamIn {
        StreamIn {
            addr: EndpointAddress::new(num, Direction::In),
            enabled: false,
            stalled: false,
            hw_bank: Bank::Even,
            toggle: false,
            tx: Deque::new(),
        }
    }

    fn slot(&self, bank: Bank) -> usize { Bdt::index(self.addr.num, Direction::In, bank) }

    fn toggle_for(&self, bank: Bank) -> bool { if bank == self.hw_bank { self.toggle } else { !self.toggle } }

    /// True while another packet can be queued without piling up.
    pub fn can_send(&self) -> bool { self.enabled && self.tx.len() < TX_PENDING_LIMIT }

    /// Queues `id` for transmission. Gives the packet back if the endpoint is off
    /// or its queue is full.
    pub fn send(&mut self, bdt: &mut Bdt, pool: &PacketPool, id: PacketId) -> Result<(), PacketId> {
        if !self.enabled {
            return Err(id);
        }
        self.tx.push_back(id)?;
        self.pump(bdt, pool);
        Ok(())
    }

    /// True when nothing is queued or waiting in a slot.
    pub fn idle(&self, bdt: &Bdt) -> bool {
        self.tx.is_empty() && !bdt.is_armed(self.slot(Bank::Even)) && !bdt.is_armed(self.slot(Bank::Odd))
    }

    fn pump(&mut self, bdt: &mut Bdt, pool: &PacketPool) {
        if self.stalled {
            return;
        }
        for bank in [self.hw_bank, self.hw_bank.other()] {
            let slot = self.slot(bank);
            if bdt.is_armed(slot) {
                continue;
            }
            let Some(id) = self.tx.pop_front() else { break };
            bdt.arm(slot, id, pool.dma_addr(id), pool.packet(id).count, self.toggle_for(bank));
        }
    }

    pub fn reset_banks(&mut self) { self.hw_bank = Bank::Even }
}

impl Pipe for StreamIn {
    fn address(&self) -> EndpointAddress { self.addr }

    fn enable<S: Sie>(&mut self, sie: &S, _bdt: &mut Bdt, _pool: &mut PacketPool) {
        self.enabled = true;
        self.stalled = false;
        self.toggle = false;
        update_endpt(sie, self.addr.num, |e| e.set_eptxen(true));
    }

    fn disable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, _pool: &mut PacketPool, drained: &mut Drained) {
        self.enabled = false;
        self.stalled = false;
        update_endpt(sie, self.addr.num, |e| e.set_eptxen(false));
        for bank in [Bank::Even, Bank::Odd] {
            if let (Some(id), _) = bdt.retire(self.slot(bank)) {
                drained.push(id).ok();
            }
        }
        while let Some(id) = self.tx.pop_front() {
            drained.push(id).ok();
        }
    }

    fn isr(&mut self, bdt: &mut Bdt, pool: &mut PacketPool, bank: Bank) -> Option<PacketId> {
        let (id, ctl) = bdt.retire(self.slot(bank));
        if id.is_none() {
            log::warn!("{:?}: completion on idle {:?} slot", self.addr, bank);
            return None;
        }
        self.hw_bank = bank.other();
        self.toggle = !ctl.data1();
        self.pump(bdt, pool);
        id
    }

    fn give(&mut self, _bdt: &mut Bdt, _id: PacketId, _addr: u32) -> bool { false }

    fn stall(&mut self, bdt: &mut Bdt) {
        self.stalled = true;
        bdt.stall(self.slot(self.hw_bank));
    }

    fn unstall(&mut self, bdt: &mut Bdt, pool: &mut PacketPool) {
        self.stalled = false;
        self.toggle = false;
        for bank in [self.hw_bank, self.hw_bank.other()] {
            let slot = self.slot(bank);
            match bdt.owner(slot) {
                Some(id) => {
                    let addr = bdt.entry(slot).address();
                    bdt.rearm(slot, addr, pool.packet(id).count, self.toggle_for(bank));
                }
                None => bdt.clear(slot),
            }
        }
        self.pump(bdt, pool);
    }

    fn stalled(&self) -> bool { self.stalled }
}
