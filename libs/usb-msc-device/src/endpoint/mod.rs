//! Endpoints and the (number, direction) directory.
//!
//! Endpoint kinds are a plain tagged variant; the shared behavior of the two bulk
//! streams is the [`Pipe`] capability trait. Endpoint 0 is always [`Control`] and
//! claims both directions.
//!
//! [`Control`]: EndpointKind::Control
use core::fmt;

use heapless::Vec;

use crate::bdt::Bdt;
use crate::hw::{Endpt, Reg, Sie};
use crate::packet::{PacketId, PacketPool};
use crate::NUM_PACKETS;

mod control;
mod stream;

pub use control::{ControlEndpoint, Stage};
pub use stream::{StreamIn, StreamOut};

/// Packets handed back by an endpoint that still need to be released to the pool.
pub type Drained = Vec<PacketId, NUM_PACKETS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out = 0,
    /// Device to host.
    In = 1,
}

/// One of the two ping-pong buffer descriptor slots per endpoint and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Even = 0,
    Odd = 1,
}

impl Bank {
    pub fn other(self) -> Bank {
        match self {
            Bank::Even => Bank::Odd,
            Bank::Odd => Bank::Even,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress {
    pub num: u8,
    pub dir: Direction,
}

impl EndpointAddress {
    pub const fn new(num: u8, dir: Direction) -> EndpointAddress { EndpointAddress { num, dir } }

    /// Decodes the endpoint field of a request's wIndex.
    pub fn from_index(index: u16) -> EndpointAddress {
        let dir = if index & 0x80 != 0 { Direction::In } else { Direction::Out };
        EndpointAddress { num: (index & 0x0F) as u8, dir }
    }

    /// bEndpointAddress as it appears in descriptors.
    pub fn to_byte(self) -> u8 { self.num | ((self.dir as u8) << 7) }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ep{:02x}", self.to_byte()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    BulkIn,
    BulkOut,
}

/// Maps (number, direction) to the endpoint registered there.
pub struct Directory([[Option<EndpointKind>; 2]; 16]);

impl Directory {
    pub const fn new() -> Directory { Directory([[None; 2]; 16]) }

    pub fn register(&mut self, ep: EndpointAddress, kind: EndpointKind) {
        self.0[ep.num as usize & 0xF][ep.dir as usize] = Some(kind);
        if kind == EndpointKind::Control {
            self.0[ep.num as usize & 0xF] = [Some(kind); 2];
        }
    }

    pub fn lookup(&self, ep: EndpointAddress) -> Option<EndpointKind> { self.0[ep.num as usize & 0xF][ep.dir as usize] }
}

impl Default for Directory {
    fn default() -> Self { Self::new() }
}

/// Capabilities shared by the bulk stream endpoints.
pub trait Pipe {
    fn address(&self) -> EndpointAddress;

    fn enable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &mut PacketPool);

    /// Stops the endpoint and moves every packet it holds into `drained`.
    fn disable<S: Sie>(&mut self, sie: &S, bdt: &mut Bdt, pool: &mut PacketPool, drained: &mut Drained);

    /// Token completion on `bank`. Returns a packet the caller must release.
    fn isr(&mut self, bdt: &mut Bdt, pool: &mut PacketPool, bank: Bank) -> Option<PacketId>;

    /// Offers a packet released by someone else. Returns false to refuse it.
    fn give(&mut self, bdt: &mut Bdt, id: PacketId, addr: u32) -> bool;

    fn stall(&mut self, bdt: &mut Bdt);

    /// Clears the halt condition and resets the data toggle to DATA0.
    fn unstall(&mut self, bdt: &mut Bdt, pool: &mut PacketPool);

    fn stalled(&self) -> bool;
}

/// Read-modify-write of an ENDPTn register. Bulk IN and bulk OUT share endpoint
/// number 1, so each side only touches its own enable bit.
pub(crate) fn update_endpt<S: Sie, F: FnOnce(&mut Endpt)>(sie: &S, num: u8, f: F) {
    sie.modify(Reg::Endpt(num), |value| {
        let mut endpt = Endpt(value);
        f(&mut endpt);
        endpt.set_ephshk(endpt.eptxen() || endpt.eprxen());
        endpt.0
    });
}
