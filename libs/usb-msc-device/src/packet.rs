//! Fixed pool of max-packet-size buffers shared by every endpoint.
//!
//! A packet has exactly one owner at a time: the pool, a buffer descriptor slot,
//! or a software queue. When the pool runs dry, an endpoint asking through
//! [`PacketPool::acquire_for`] is remembered, and the next released packet is
//! offered to the longest-waiting endpoint before it returns to the free set.
use heapless::Deque;

use crate::endpoint::EndpointAddress;
use crate::{MAX_PKT_SIZE, NUM_PACKETS};

/// One entry per endpoint address that may register demand.
const MAX_WAITERS: usize = 4;

#[repr(C, align(4))]
pub struct Packet {
    pub buf: [u8; MAX_PKT_SIZE],
    /// Bytes in use.
    pub count: usize,
}

impl Packet {
    pub const fn new() -> Packet { Packet { buf: [0; MAX_PKT_SIZE], count: 0 } }

    pub fn data(&self) -> &[u8] { &self.buf[..self.count.min(MAX_PKT_SIZE)] }
}

impl Default for Packet {
    fn default() -> Self { Self::new() }
}

/// Backing storage for the pool. The SIE DMAs into it, so it must outlive the
/// device; place it in a `static`.
pub type PacketStorage = [Packet; NUM_PACKETS];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PacketId(u8);

impl PacketId {
    pub(crate) const fn new(index: u8) -> PacketId { PacketId(index) }

    pub fn index(&self) -> usize { self.0 as usize }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ep: EndpointAddress,
    need: u16,
}

pub struct PacketPool {
    packets: &'static mut PacketStorage,
    /// Bit n set: packet n is free.
    free: u32,
    waiters: Deque<Waiter, MAX_WAITERS>,
}

impl PacketPool {
    pub fn new(packets: &'static mut PacketStorage) -> PacketPool {
        PacketPool { packets, free: u32::MAX >> (32 - NUM_PACKETS), waiters: Deque::new() }
    }

    pub fn available(&self) -> usize { self.free.count_ones() as usize }

    pub fn in_use(&self) -> usize { NUM_PACKETS - self.available() }

    pub fn acquire(&mut self) -> Option<PacketId> {
        if self.free == 0 {
            return None;
        }
        let index = self.free.trailing_zeros();
        self.free &= !(1 << index);
        self.packets[index as usize].count = 0;
        Some(PacketId(index as u8))
    }

    /// Like [`acquire`](Self::acquire), but on failure records one unit of demand
    /// for `ep`. The demand is later satisfied through the `grant` callback of
    /// [`release`](Self::release).
    pub fn acquire_for(&mut self, ep: EndpointAddress) -> Option<PacketId> {
        let id = self.acquire();
        if id.is_none() {
            if let Some(waiter) = self.waiters.iter_mut().find(|w| w.ep == ep) {
                waiter.need += 1;
            } else if self.waiters.push_back(Waiter { ep, need: 1 }).is_err() {
                log::warn!("packet demand from {:?} dropped, waiter list full", ep);
            }
        }
        id
    }

    /// Outstanding demand registered by `ep`.
    pub fn need(&self, ep: EndpointAddress) -> u16 {
        self.waiters.iter().find(|w| w.ep == ep).map(|w| w.need).unwrap_or(0)
    }

    /// Returns `id` to circulation. If endpoints are waiting, the packet is offered
    /// to them in arrival order through `grant(ep, id, dma_addr)`. A waiter that
    /// refuses loses its whole remaining demand. At most one waiter receives the
    /// packet; if none takes it, it goes back to the free set.
    pub fn release<F>(&mut self, id: PacketId, mut grant: F)
    where
        F: FnMut(EndpointAddress, PacketId, u32) -> bool,
    {
        let bit = 1u32 << id.0;
        if self.free & bit != 0 {
            log::error!("double release of {:?}", id);
            return;
        }
        self.packets[id.index()].count = 0;
        let addr = self.dma_addr(id);
        while let Some(waiter) = self.waiters.front_mut() {
            if grant(waiter.ep, id, addr) {
                waiter.need -= 1;
                if waiter.need == 0 {
                    self.waiters.pop_front();
                }
                return;
            }
            log::trace!("{:?} refused a granted packet, dropping its demand", waiter.ep);
            self.waiters.pop_front();
        }
        self.free |= bit;
    }

    /// Forgets all registered demand.
    pub fn clear_waiters(&mut self) { self.waiters.clear() }

    /// Forgets demand registered by one endpoint.
    pub fn cancel(&mut self, ep: EndpointAddress) {
        let mut kept: Deque<Waiter, MAX_WAITERS> = Deque::new();
        while let Some(w) = self.waiters.pop_front() {
            if w.ep != ep {
                kept.push_back(w).ok();
            }
        }
        self.waiters = kept;
    }

    pub fn packet(&self, id: PacketId) -> &Packet { &self.packets[id.index()] }

    pub fn packet_mut(&mut self, id: PacketId) -> &mut Packet { &mut self.packets[id.index()] }

    /// Bus address of the packet's buffer, as programmed into a buffer descriptor.
    pub fn dma_addr(&self, id: PacketId) -> u32 { self.packets[id.index()].buf.as_ptr() as usize as u32 }
}
