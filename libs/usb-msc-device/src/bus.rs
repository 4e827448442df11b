//! Everything the SIE shares with software: the register handle, the buffer
//! descriptor table, the packet pool and the endpoints built on top of them.
use crate::bdt::{BdTable, Bdt};
use crate::endpoint::{
    Bank, ControlEndpoint, Direction, Drained, Directory, EndpointAddress, EndpointKind, Pipe, StreamIn,
    StreamOut,
};
use crate::error::Error;
use crate::hw::{Sie, Stat};
use crate::logging::*;
use crate::packet::{PacketId, PacketPool, PacketStorage};

pub const EP0_OUT: EndpointAddress = EndpointAddress::new(0, Direction::Out);
pub const BULK_IN: EndpointAddress = EndpointAddress::new(1, Direction::In);
pub const BULK_OUT: EndpointAddress = EndpointAddress::new(1, Direction::Out);

pub struct Endpoints<S: Sie> {
    pub(crate) sie: S,
    pub(crate) bdt: Bdt,
    pub(crate) pool: PacketPool,
    directory: Directory,
    pub(crate) ep0: ControlEndpoint,
    pub(crate) bulk_in: StreamIn,
    pub(crate) bulk_out: StreamOut,
}

impl<S: Sie> Endpoints<S> {
    pub fn new(sie: S, table: &'static BdTable, packets: &'static mut PacketStorage) -> Result<Self, Error> {
        let mut pool = PacketPool::new(packets);
        let setup_pkt = pool.acquire().ok_or(Error::PoolExhausted)?;
        let status_pkt = pool.acquire().ok_or(Error::PoolExhausted)?;
        let mut directory = Directory::new();
        directory.register(EP0_OUT, EndpointKind::Control);
        directory.register(BULK_IN, EndpointKind::BulkIn);
        directory.register(BULK_OUT, EndpointKind::BulkOut);
        Ok(Endpoints {
            sie,
            bdt: Bdt::new(table),
            pool,
            directory,
            ep0: ControlEndpoint::new(setup_pkt, status_pkt),
            bulk_in: StreamIn::new(BULK_IN.num),
            bulk_out: StreamOut::new(BULK_OUT.num),
        })
    }

    pub fn lookup(&self, ep: EndpointAddress) -> Option<EndpointKind> { self.directory.lookup(ep) }

    /// Returns `id` to the pool, offering it first to endpoints starved of packets.
    pub fn release(&mut self, id: PacketId) {
        let Self { bdt, pool, directory, bulk_in, bulk_out, .. } = self;
        pool.release(id, |ep, id, addr| match directory.lookup(ep) {
            Some(EndpointKind::BulkOut) => bulk_out.give(bdt, id, addr),
            Some(EndpointKind::BulkIn) => bulk_in.give(bdt, id, addr),
            _ => false,
        });
    }

    fn release_all(&mut self, drained: Drained) {
        for id in drained {
            self.release(id);
        }
    }

    /// Token completion reported through STAT. Returns a device address when a
    /// Set Address request has just completed its Status stage.
    pub fn token_done(&mut self, stat: Stat) -> Option<u8> {
        let dir = if stat.tx() { Direction::In } else { Direction::Out };
        let bank = if stat.odd() { Bank::Odd } else { Bank::Even };
        let ep = EndpointAddress::new(stat.endp(), dir);
        trace_usb!("token done {:?} {:?}", ep, bank);
        let mut drained = Drained::new();
        let address = match self.directory.lookup(ep) {
            Some(EndpointKind::Control) => {
                self.ep0.isr(&self.sie, &mut self.bdt, &mut self.pool, dir, bank, &mut drained)
            }
            Some(EndpointKind::BulkIn) => {
                if let Some(id) = self.bulk_in.isr(&mut self.bdt, &mut self.pool, bank) {
                    drained.push(id).ok();
                }
                None
            }
            Some(EndpointKind::BulkOut) => {
                if let Some(id) = self.bulk_out.isr(&mut self.bdt, &mut self.pool, bank) {
                    drained.push(id).ok();
                }
                None
            }
            None => {
                log::warn!("token done on unknown endpoint {:?}", ep);
                None
            }
        };
        self.release_all(drained);
        address
    }

    /// Disables every endpoint and returns all packets they held to the pool.
    pub fn disable_all(&mut self) {
        let mut drained = Drained::new();
        self.ep0.disable(&self.sie, &mut self.bdt, &mut drained);
        self.bulk_in.disable(&self.sie, &mut self.bdt, &mut self.pool, &mut drained);
        self.bulk_out.disable(&self.sie, &mut self.bdt, &mut self.pool, &mut drained);
        self.pool.clear_waiters();
        self.release_all(drained);
    }

    /// Bus reset: the SIE's ping-pong pointers have been reset to Even.
    pub fn bus_reset(&mut self) {
        self.disable_all();
        self.ep0.reset_banks();
        self.bulk_in.reset_banks();
        self.bulk_out.reset_banks();
        self.ep0.enable(&self.sie, &mut self.bdt, &self.pool);
    }

    pub fn enable_bulk(&mut self) {
        self.bulk_in.enable(&self.sie, &mut self.bdt, &mut self.pool);
        self.bulk_out.enable(&self.sie, &mut self.bdt, &mut self.pool);
    }

    pub fn disable_bulk(&mut self) {
        let mut drained = Drained::new();
        self.bulk_in.disable(&self.sie, &mut self.bdt, &mut self.pool, &mut drained);
        self.bulk_out.disable(&self.sie, &mut self.bdt, &mut self.pool, &mut drained);
        self.release_all(drained);
    }

    pub fn ep0_send(&mut self, id: PacketId, last: bool) {
        if let Err(id) = self.ep0.send(&mut self.bdt, &self.pool, id, last) {
            log::error!("ep0 transmit queue full");
            self.release(id);
        }
    }

    pub fn ep0_send_status(&mut self) { self.ep0.send_status(&mut self.bdt, &mut self.pool) }

    pub fn ep0_stall(&mut self) { self.ep0.stall(&self.sie, &mut self.bdt, &self.pool) }

    pub fn ep0_unstall(&mut self) { self.ep0.unstall(&self.sie) }

    pub fn bulk_in_send(&mut self, id: PacketId) {
        if let Err(id) = self.bulk_in.send(&mut self.bdt, &self.pool, id) {
            log::warn!("{:?} refused a packet", BULK_IN);
            self.release(id);
        }
    }

    /// Next filled bulk OUT packet. The endpoint re-arms any slot it left idle.
    pub fn bulk_out_pop(&mut self) -> Option<PacketId> {
        let id = self.bulk_out.pop();
        if id.is_some() {
            self.bulk_out.refill(&mut self.bdt, &mut self.pool);
        }
        id
    }

    pub fn stall_bulk_in(&mut self) { self.bulk_in.stall(&mut self.bdt) }

    /// Halt state of a known endpoint, as reported by Get Status.
    pub fn halted(&self, ep: EndpointAddress) -> Option<bool> {
        match self.directory.lookup(ep)? {
            EndpointKind::Control => Some(self.ep0.stalled()),
            EndpointKind::BulkIn => Some(self.bulk_in.stalled()),
            EndpointKind::BulkOut => Some(self.bulk_out.stalled()),
        }
    }

    /// Set Feature(ENDPOINT_HALT) / Clear Feature(ENDPOINT_HALT) on a bulk endpoint.
    pub fn set_halt(&mut self, ep: EndpointAddress, halt: bool) -> bool {
        match self.directory.lookup(ep) {
            Some(EndpointKind::BulkIn) if halt => self.bulk_in.stall(&mut self.bdt),
            Some(EndpointKind::BulkIn) => self.bulk_in.unstall(&mut self.bdt, &mut self.pool),
            Some(EndpointKind::BulkOut) if halt => self.bulk_out.stall(&mut self.bdt),
            Some(EndpointKind::BulkOut) => self.bulk_out.unstall(&mut self.bdt, &mut self.pool),
            _ => return false,
        }
        true
    }
}
