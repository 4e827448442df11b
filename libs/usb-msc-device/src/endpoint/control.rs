use heapless::Deque;
use num_traits::FromPrimitive;

use super::{update_endpt, Bank, Direction, Drained};
use crate::bdt::{Bdt, TokenPid};
use crate::hw::{Ctl, Reg, Sie};
use crate::logging::*;
use crate::packet::{PacketId, PacketPool};
use crate::MAX_PKT_SIZE;

/// IN packets that may wait for a free slot during one control transfer.
const TX_QUEUE_DEPTH: usize = 8;

/// Control transfer stage, as seen by the hardware side of endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Data,
    Status,
}

/// Hardware side of endpoint 0: slot bookkeeping, data toggle and stage tracking.
///
/// Two packets are reserved for the lifetime of the endpoint. `setup_pkt` receives
/// Setup stages, `status_pkt` carries the zero-length Status stage in either
/// direction. Data stage packets come from the shared pool and go back to it once
/// sent.
pub struct ControlEndpoint {
    stage: Stage,
    /// Direction of the transfer in progress, from bmRequestType bit 7.
    request_in: bool,
    /// Bank the SIE fills next on the OUT side.
    rx_next: Bank,
    /// Bank the SIE sends next on the IN side.
    tx_next: Bank,
    /// Bank the next IN packet is armed into.
    tx_arm: Bank,
    toggle: bool,
    setup_pkt: PacketId,
    status_pkt: PacketId,
    tx_queue: Deque<(PacketId, bool), TX_QUEUE_DEPTH>,
    setup: Option<[u8; 8]>,
    pending_address: Option<u8>,
    stalled: bool,
}

impl ControlEndpoint {
    pub fn new(setup_pkt: PacketId, status_pkt: PacketId) -> ControlEndpoint {
        ControlEndpoint {
            stage: Stage::Setup,
            request_in: false,
            rx_next: Bank::Even,
            tx_next: Bank::Even,
            tx_arm: Bank::Even,
            toggle: false,
            setup_pkt,
            status_pkt,
            tx_queue: Deque::new(),
            setup: None,
            pending_address: None,
            stalled: false,
        }
    }

    fn rx_slot(bank: Bank) -> usize { Bdt::index(0, Direction::Out, bank) }

    fn tx_slot(bank: Bank) -> usize { Bdt::index(0, Direction::In, bank) }

    fn is_reserved(&self, id: PacketId) -> bool { id == self.setup_pkt || id == self.status_pkt }

    pub fn stage(&self) -> Stage { self.stage }

    pub fn stalled(&self) -> bool { self.stalled }

    pub fn reset_banks(&mut self) {
        self.rx_next = Bank::Even;
        self.tx_next = Bank::Even;
        self.tx_arm = Bank::Even;
    }

    pub fn enable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &PacketPool) {
        update_endpt(sie, 0, |e| {
            e.set_eptxen(true);
            e.set_eprxen(true);
            e.set_epstall(false);
        });
        self.stalled = false;
        self.stage = Stage::Setup;
        self.setup = None;
        self.pending_address = None;
        self.arm_setup(bdt, pool, self.rx_next);
    }

    pub fn disable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, drained: &mut Drained) {
        sie.write(Reg::Endpt(0), 0);
        self.reclaim_rx(bdt);
        self.flush_tx(bdt, drained);
        self.setup = None;
        self.pending_address = None;
    }

    /// The 8 Setup bytes received since the last call, if any.
    pub fn take_setup(&mut self) -> Option<[u8; 8]> { self.setup.take() }

    /// Address to apply once the Status stage IN is acknowledged.
    pub fn set_pending_address(&mut self, address: u8) { self.pending_address = Some(address) }

    pub fn can_queue(&self) -> bool { !self.tx_queue.is_full() }

    fn arm_setup(&mut self, bdt: &mut Bdt, pool: &PacketPool, bank: Bank) {
        let slot = Self::rx_slot(bank);
        if bdt.owner(Self::rx_slot(Bank::Even)) == Some(self.setup_pkt)
            || bdt.owner(Self::rx_slot(Bank::Odd)) == Some(self.setup_pkt)
        {
            return;
        }
        bdt.arm(slot, self.setup_pkt, pool.dma_addr(self.setup_pkt), MAX_PKT_SIZE, false);
    }

    /// Takes both OUT slots back; they only ever hold the two reserved packets.
    fn reclaim_rx(&mut self, bdt: &mut Bdt) {
        for bank in [Bank::Even, Bank::Odd] {
            bdt.retire(Self::rx_slot(bank));
        }
    }

    fn flush_tx(&mut self, bdt: &mut Bdt, drained: &mut Drained) {
        for bank in [Bank::Even, Bank::Odd] {
            if let (Some(id), _) = bdt.retire(Self::tx_slot(bank)) {
                if !self.is_reserved(id) {
                    drained.push(id).ok();
                }
            }
        }
        while let Some((id, _)) = self.tx_queue.pop_front() {
            if !self.is_reserved(id) {
                drained.push(id).ok();
            }
        }
        self.tx_arm = self.tx_next;
    }

    /// Token completion on endpoint 0. Packets to release land in `drained`.
    /// Returns a device address when a Set Address request just completed.
    pub fn isr<S: Sie>(
        &mut self,
        sie: &S,
        bdt: &mut Bdt,
        pool: &mut PacketPool,
        dir: Direction,
        bank: Bank,
        drained: &mut Drained,
    ) -> Option<u8> {
        match dir {
            Direction::Out => {
                let (id, ctl) = bdt.retire(Self::rx_slot(bank));
                self.rx_next = bank.other();
                let id = id?;
                pool.packet_mut(id).count = ctl.byte_count() as usize;
                match TokenPid::from_u8(ctl.pid()) {
                    Some(TokenPid::Setup) => self.on_setup(sie, bdt, pool, id, drained),
                    _ if id == self.status_pkt => trace_usb!("ep0 status out done"),
                    _ => {
                        // data stage OUT is never requested; recycle the slot
                        log::debug!("ep0: unexpected OUT of {} bytes", ctl.byte_count());
                        self.arm_setup(bdt, pool, self.rx_next);
                    }
                }
                None
            }
            Direction::In => {
                let (id, _) = bdt.retire(Self::tx_slot(bank));
                self.tx_next = bank.other();
                let mut address = None;
                match id {
                    Some(id) if id == self.status_pkt => {
                        if self.stage == Stage::Status {
                            address = self.pending_address.take();
                        }
                    }
                    Some(id) => {
                        drained.push(id).ok();
                    }
                    None => log::warn!("ep0: IN completion on idle {:?} slot", bank),
                }
                if let Some((id, last)) = self.tx_queue.pop_front() {
                    self.tx(bdt, pool, id, last);
                }
                address
            }
        }
    }

    fn on_setup<S: Sie>(
        &mut self,
        sie: &S,
        bdt: &mut Bdt,
        pool: &PacketPool,
        id: PacketId,
        drained: &mut Drained,
    ) {
        // a Setup aborts whatever transfer was in flight
        self.reclaim_rx(bdt);
        self.flush_tx(bdt, drained);
        self.pending_address = None;
        if self.stalled {
            self.unstall(sie);
        }
        let pkt = pool.packet(id);
        if pkt.count == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&pkt.buf[..8]);
            self.request_in = raw[0] & 0x80 != 0;
            self.setup = Some(raw);
            self.stage = Stage::Setup;
            self.toggle = true;
        } else {
            log::debug!("ep0: setup with {} bytes", pkt.count);
            self.setup = None;
            self.stall(sie, bdt, pool);
        }
        sie.modify(Reg::Ctl, |v| {
            let mut ctl = Ctl(v);
            ctl.set_txsuspendtokenbusy(false);
            ctl.0
        });
    }

    /// Queues an IN packet of the Data or Status stage. `last` marks the packet that
    /// ends the Data stage. Gives the packet back if the queue is full.
    pub fn send(&mut self, bdt: &mut Bdt, pool: &PacketPool, id: PacketId, last: bool) -> Result<(), PacketId> {
        if bdt.is_armed(Self::tx_slot(self.tx_arm)) {
            return self.tx_queue.push_back((id, last)).map_err(|(id, _)| id);
        }
        self.tx(bdt, pool, id, last);
        Ok(())
    }

    /// Zero-length DATA1 IN that acknowledges an OUT request.
    pub fn send_status(&mut self, bdt: &mut Bdt, pool: &mut PacketPool) {
        pool.packet_mut(self.status_pkt).count = 0;
        let id = self.status_pkt;
        if self.send(bdt, pool, id, true).is_err() {
            log::error!("ep0: no room for the status stage");
        }
    }

    fn tx(&mut self, bdt: &mut Bdt, pool: &PacketPool, id: PacketId, last: bool) {
        let slot = Self::tx_slot(self.tx_arm);
        bdt.arm(slot, id, pool.dma_addr(id), pool.packet(id).count, self.toggle);
        self.toggle = !self.toggle;
        self.tx_arm = self.tx_arm.other();
        if last {
            self.enter_status(bdt, pool);
        } else {
            self.stage = Stage::Data;
        }
    }

    /// Arms the OUT side for the end of the transfer. After an IN Data stage the
    /// host sends a zero-length DATA1 OUT; the next Setup slot goes right behind it
    /// so back-to-back transfers are never missed.
    fn enter_status(&mut self, bdt: &mut Bdt, pool: &PacketPool) {
        self.stage = Stage::Status;
        if self.request_in {
            let slot = Self::rx_slot(self.rx_next);
            bdt.arm(slot, self.status_pkt, pool.dma_addr(self.status_pkt), MAX_PKT_SIZE, true);
            self.arm_setup(bdt, pool, self.rx_next.other());
        } else {
            self.arm_setup(bdt, pool, self.rx_next);
        }
        self.toggle = false;
    }

    /// Request Error: STALL both directions until the next Setup.
    pub fn stall<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &PacketPool) {
        update_endpt(sie, 0, |e| e.set_epstall(true));
        self.stalled = true;
        self.stage = Stage::Setup;
        self.arm_setup(bdt, pool, self.rx_next);
    }

    pub fn unstall<S: Sie>(&mut self, sie: &S) {
        update_endpt(sie, 0, |e| e.set_epstall(false));
        self.stalled = false;
    }
}
