//! USB Bulk-Only Transport over the bulk IN / bulk OUT pair.
//!
//! 1. Reads a CBW from bulk OUT and hands its command block to [`Scsi`]
//! 1. Moves the data phase one packet at a time in the CBW's direction
//! 1. Terminates a short IN data phase with a zero-length packet when needed
//! 1. Receives and discards OUT data the command did not consume
//! 1. Sends the CSW with the data residue
mod command_block_wrapper;
mod command_status_wrapper;

pub use command_block_wrapper::CommandBlockWrapper;
pub use command_status_wrapper::{CommandStatus, CommandStatusWrapper};

use crate::block_device::BlockDevice;
use crate::bus::Endpoints;
use crate::endpoint::Direction;
use crate::error::ScsiError;
use crate::hw::{Sie, SystemClock};
use crate::logging::*;
use crate::scsi::Scsi;
use crate::MAX_PKT_SIZE;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum State {
    /// Waiting for a command block wrapper to arrive on bulk OUT.
    Command,
    /// Moving data in the direction the CBW announced.
    Data,
    /// The IN data phase stopped short of the announced length right after a full
    /// packet (or before any data). Sends a ZLP then moves to Status.
    NeedZlp,
    /// The OUT data phase ended before the announced length was consumed. The
    /// rest of the host's data is received and dropped; the residue stays.
    Discard,
    /// Sends the command status wrapper and returns to Command.
    Status,
}

impl From<ScsiError> for CommandStatus {
    fn from(e: ScsiError) -> CommandStatus {
        match e {
            ScsiError::Failed => CommandStatus::Failed,
            ScsiError::Structural => CommandStatus::PhaseError,
        }
    }
}

pub struct BulkOnlyIface<B: BlockDevice> {
    scsi: Scsi<B>,
    state: State,
    direction: Direction,
    tag: u32,
    transfer_length: u32,
    transferred: u32,
    /// OUT bytes still to drop in [`State::Discard`].
    to_discard: u32,
    status: CommandStatus,
    /// Tracks if the last IN packet was full. Used to decide on a ZLP.
    last_packet_full: bool,
}

impl<B: BlockDevice> BulkOnlyIface<B> {
    pub fn new(scsi: Scsi<B>) -> Self {
        BulkOnlyIface {
            scsi,
            state: State::Command,
            direction: Direction::Out,
            tag: 0,
            transfer_length: 0,
            transferred: 0,
            to_discard: 0,
            status: CommandStatus::Passed,
            last_packet_full: false,
        }
    }

    pub fn state(&self) -> State { self.state }

    pub fn scsi(&self) -> &Scsi<B> { &self.scsi }

    pub fn scsi_mut(&mut self) -> &mut Scsi<B> { &mut self.scsi }

    pub fn enable<S: Sie>(&mut self, bus: &mut Endpoints<S>) {
        bus.enable_bulk();
        self.reset(bus);
    }

    pub fn disable<S: Sie>(&mut self, bus: &mut Endpoints<S>) {
        bus.disable_bulk();
        self.reset(bus);
    }

    pub fn reconfigure<S: Sie>(&mut self, bus: &mut Endpoints<S>) {
        self.disable(bus);
        self.enable(bus);
    }

    /// Bulk-Only Mass Storage Reset: back to waiting for a CBW. Packets already
    /// received for the abandoned command are dropped so they are not taken for
    /// CBWs. Endpoint toggles and halt state are left alone.
    pub fn reset<S: Sie>(&mut self, bus: &mut Endpoints<S>) {
        if self.state != State::Command {
            trace_bot!("reset from {:?}", self.state);
        }
        let mut dropped = 0;
        while let Some(id) = bus.bulk_out_pop() {
            bus.release(id);
            dropped += 1;
        }
        if dropped != 0 {
            log::debug!("reset dropped {} bulk OUT packets", dropped);
        }
        self.scsi.abort();
        self.set_state(State::Command);
    }

    /// Advances the transport as far as packets and endpoint space allow.
    pub fn process<S: Sie, C: SystemClock>(&mut self, bus: &mut Endpoints<S>, clock: &C) {
        while self.step(bus, clock) {}
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace_bot!("{:?} -> {:?}", self.state, state);
        }
        self.state = state;
    }

    /// One unit of work. Returns whether anything happened.
    fn step<S: Sie, C: SystemClock>(&mut self, bus: &mut Endpoints<S>, clock: &C) -> bool {
        match self.state {
            State::Command => self.command(bus),
            State::Data if self.direction == Direction::In => self.data_in(bus, clock),
            State::Data => self.data_out(bus, clock),
            State::NeedZlp => self.zlp(bus),
            State::Discard => self.discard(bus),
            State::Status => self.send_status(bus),
        }
    }

    fn remaining(&self) -> u32 { self.transfer_length - self.transferred }

    /// Ends the data phase (or skips it) with `status`.
    fn finish(&mut self, status: CommandStatus) {
        self.status = status;
        let short = self.transferred < self.transfer_length;
        if self.direction == Direction::In && short && self.last_packet_full {
            self.set_state(State::NeedZlp);
        } else if self.direction == Direction::Out && short {
            // the host still sends everything the CBW announced
            self.to_discard = self.remaining();
            self.set_state(State::Discard);
        } else {
            self.set_state(State::Status);
        }
    }

    fn command<S: Sie>(&mut self, bus: &mut Endpoints<S>) -> bool {
        let Some(id) = bus.bulk_out_pop() else { return false };
        let cbw = CommandBlockWrapper::parse(bus.pool.packet(id).data());
        bus.release(id);
        let Some(cbw) = cbw else {
            // Host expects a stall on bulk IN
            log::warn!("invalid CBW, stalling bulk IN");
            bus.stall_bulk_in();
            return true;
        };
        trace_bot!("CBW tag {:#x} {:?} {} bytes lun {}", cbw.tag, cbw.direction, cbw.data_transfer_length, cbw.lun);

        self.direction = cbw.direction;
        self.tag = cbw.tag;
        self.transfer_length = cbw.data_transfer_length;
        self.transferred = 0;
        // A data phase that produces nothing still needs a short packet.
        self.last_packet_full = true;

        match self.scsi.request(cbw.lun, cbw.command()) {
            Ok(()) if self.transfer_length != 0 => {
                self.status = CommandStatus::Passed;
                self.set_state(State::Data);
            }
            Ok(()) => self.finish(CommandStatus::Passed),
            Err(e) => self.finish(e.into()),
        }
        true
    }

    fn data_out<S: Sie, C: SystemClock>(&mut self, bus: &mut Endpoints<S>, clock: &C) -> bool {
        let Some(id) = bus.bulk_out_pop() else { return false };
        let data = bus.pool.packet(id).data();
        let host_done = data.len() < MAX_PKT_SIZE;
        let count = data.len().min(self.remaining() as usize);
        let result = self.scsi.write(&data[..count], clock);
        bus.release(id);
        match result {
            Ok(n) => {
                self.transferred += (n as u32).min(self.remaining());
                if self.remaining() == 0 || self.scsi.done() {
                    self.finish(CommandStatus::Passed);
                }
            }
            Err(e) => self.finish(e.into()),
        }
        if host_done && self.state == State::Discard {
            self.set_state(State::Status);
        }
        true
    }

    fn data_in<S: Sie, C: SystemClock>(&mut self, bus: &mut Endpoints<S>, clock: &C) -> bool {
        if self.scsi.done() {
            self.finish(CommandStatus::Passed);
            return true;
        }
        if !bus.bulk_in.can_send() {
            return false;
        }
        let Some(id) = bus.pool.acquire() else { return false };
        let size = (self.remaining() as usize).min(MAX_PKT_SIZE);
        let pkt = bus.pool.packet_mut(id);
        match self.scsi.read(&mut pkt.buf[..size], clock) {
            Ok(0) => {
                bus.release(id);
                // nothing ready from the block device yet
                if self.scsi.done() {
                    self.finish(CommandStatus::Passed);
                    return true;
                }
                false
            }
            Ok(n) => {
                pkt.count = n;
                bus.bulk_in_send(id);
                self.transferred += n as u32;
                self.last_packet_full = n == MAX_PKT_SIZE;
                if self.remaining() == 0 || self.scsi.done() {
                    self.finish(CommandStatus::Passed);
                }
                true
            }
            Err(e) => {
                bus.release(id);
                self.finish(e.into());
                true
            }
        }
    }

    fn discard<S: Sie>(&mut self, bus: &mut Endpoints<S>) -> bool {
        let Some(id) = bus.bulk_out_pop() else { return false };
        let count = bus.pool.packet(id).count;
        bus.release(id);
        self.to_discard -= (count as u32).min(self.to_discard);
        // a short packet ends the transfer early
        if self.to_discard == 0 || count < MAX_PKT_SIZE {
            self.set_state(State::Status);
        }
        true
    }

    fn zlp<S: Sie>(&mut self, bus: &mut Endpoints<S>) -> bool {
        if !bus.bulk_in.can_send() {
            return false;
        }
        let Some(id) = bus.pool.acquire() else { return false };
        bus.pool.packet_mut(id).count = 0;
        bus.bulk_in_send(id);
        self.set_state(State::Status);
        true
    }

    fn send_status<S: Sie>(&mut self, bus: &mut Endpoints<S>) -> bool {
        if !bus.bulk_in.can_send() {
            return false;
        }
        let Some(id) = bus.pool.acquire() else { return false };
        let csw = CommandStatusWrapper { tag: self.tag, data_residue: self.remaining(), status: self.status };
        trace_bot!("CSW {:?}", csw);
        let pkt = bus.pool.packet_mut(id);
        pkt.buf[..command_status_wrapper::LEN].copy_from_slice(&csw.to_bytes());
        pkt.count = command_status_wrapper::LEN;
        bus.bulk_in_send(id);
        self.set_state(State::Command);
        true
    }
}
