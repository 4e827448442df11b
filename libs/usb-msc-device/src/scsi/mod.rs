//! SCSI transparent command set served over Bulk-Only Transport.
//!
//! [`Scsi::request`] validates a CDB and stages the command. The data phase then
//! moves bytes with [`Scsi::read`] (device to host) or [`Scsi::write`] (host to
//! device) until [`Scsi::done`]. Failures latch a [`Sense`] record that stays put
//! until the host reads it with Request Sense.
use byteorder::{BigEndian, ByteOrder};
use num_traits::FromPrimitive;

use crate::block_device::{BlockDevice, StreamDirection, StreamHandle};
use crate::config::Config;
use crate::error::{BlockDeviceError, Error, ScsiError};
use crate::hw::SystemClock;
use crate::logging::*;

pub mod commands;
pub mod inquiry;
pub mod mode;
pub mod sense;

pub use commands::{OpCode, Transfer};
pub use sense::{Sense, SenseKey};

use commands::cdb_len;
use inquiry::Identity;
use mode::{ModeParams, PageControl};
use sense::SENSE_LEN;

/// Largest block the device may use.
pub const BLOCK_BUF_LEN: usize = 512;
/// Largest Mode Select parameter list accepted.
pub const MAX_PARAMETER_LIST: usize = 512;

const RESPONSE_LEN: usize = 64;
const CONTROL_NACA: u8 = 1 << 2;
const READ_FORMAT_CAPACITIES_LEN: usize = 20;
const DESCRIPTOR_FORMATTED_MEDIA: u8 = 0x02;

/// Runs `op` until it succeeds, `attempts` tries have been made, or `budget_ms`
/// (when non-zero) has elapsed. On failure returns the number of tries made.
fn with_retry<C: SystemClock>(
    clock: &C,
    attempts: u8,
    budget_ms: u32,
    mut op: impl FnMut() -> Result<(), BlockDeviceError>,
) -> Result<(), u16> {
    let start = clock.millis();
    let mut tries: u16 = 0;
    loop {
        tries += 1;
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::debug!("block access failed on try {}: {:?}", tries, e);
                if tries >= attempts.max(1) as u16 {
                    return Err(tries);
                }
                if budget_ms != 0 && clock.millis().wrapping_sub(start) > budget_ms {
                    return Err(tries);
                }
            }
        }
    }
}

pub struct Scsi<B: BlockDevice> {
    device: B,
    identity: Identity,
    read_retries: u8,
    write_retries: u8,
    recovery_time_ms: u32,
    /// Latched until consumed by Request Sense.
    sense: Sense,
    response: [u8; RESPONSE_LEN],
    opcode: Option<OpCode>,
    transfer: Transfer,
    lba: u32,
    /// Bytes for response and parameter transfers, blocks for block transfers.
    transfer_length: u32,
    transferred: u32,
    /// Byte offset into the current block.
    offset: usize,
    stream: Option<StreamHandle>,
    block: [u8; BLOCK_BUF_LEN],
    /// `block` holds the current block (or the part of it written so far).
    cached: bool,
}

impl<B: BlockDevice> Scsi<B> {
    pub fn new(device: B, config: &Config) -> Result<Self, Error> {
        if B::BLOCK_BYTES == 0 || B::BLOCK_BYTES > BLOCK_BUF_LEN {
            return Err(Error::BlockSize(B::BLOCK_BYTES));
        }
        if device.blocks() == 0 {
            // no block is addressable, and Read Capacity has no last LBA to report
            return Err(BlockDeviceError::InvalidAddress.into());
        }
        Ok(Scsi {
            device,
            identity: Identity::new(config),
            read_retries: config.read_retries,
            write_retries: config.write_retries,
            recovery_time_ms: config.recovery_time_ms,
            sense: Sense::no_sense(),
            response: [0; RESPONSE_LEN],
            opcode: None,
            transfer: Transfer::None,
            lba: 0,
            transfer_length: 0,
            transferred: 0,
            offset: 0,
            stream: None,
            block: [0; BLOCK_BUF_LEN],
            cached: false,
        })
    }

    pub fn device(&self) -> &B { &self.device }

    /// Grants access to the block device for housekeeping.
    pub fn device_mut(&mut self) -> &mut B { &mut self.device }

    /// The currently latched sense record.
    pub fn sense(&self) -> &Sense { &self.sense }

    pub fn opcode(&self) -> Option<OpCode> { self.opcode }

    /// Validates `cdb` and stages the command it carries.
    pub fn request(&mut self, lun: u8, cdb: &[u8]) -> Result<(), ScsiError> {
        self.abort();
        let op = *cdb.first().ok_or(ScsiError::Structural)?;
        let len = match cdb_len(op) {
            // Some hosts pad Request Sense to 12 bytes, so only a short CDB is refused.
            Some(len) if cdb.len() >= len => len,
            _ => return Err(self.fail(Sense::invalid_command())),
        };
        let cdb = &cdb[..len];
        if cdb[len - 1] & CONTROL_NACA != 0 {
            return Err(self.fail(Sense::invalid_bit_field(len as u16 - 1, 2)));
        }
        if lun != 0 {
            return Err(self.fail(Sense::lun_not_supported()));
        }
        let opcode = match OpCode::from_u8(op) {
            Some(opcode) => opcode,
            None => {
                trace_scsi!("unsupported op code {:#04x}", op);
                return Err(self.fail(Sense::invalid_command()));
            }
        };
        trace_scsi!("{:?} {:02x?}", opcode, cdb);
        self.opcode = Some(opcode);

        let staged = match opcode {
            OpCode::TestUnitReady => Ok(()),
            OpCode::RequestSense => self.request_sense(cdb),
            OpCode::Inquiry => self.inquiry(cdb),
            OpCode::ModeSelect6 | OpCode::ModeSelect10 => self.mode_select(cdb),
            OpCode::ModeSense6 | OpCode::ModeSense10 => self.mode_sense(cdb),
            OpCode::ReadFormatCapacities => self.read_format_capacities(cdb),
            OpCode::ReadCapacity10 => self.read_capacity(),
            OpCode::Read10 => self.read10(cdb),
            OpCode::Write10 => self.write10(cdb),
            OpCode::ReportLuns => self.report_luns(cdb),
        };
        staged.map_err(|sense| self.fail(sense))
    }

    /// Whether the staged command has moved everything it declared.
    pub fn done(&self) -> bool {
        match self.transfer {
            Transfer::None => true,
            _ => self.transferred >= self.transfer_length,
        }
    }

    /// Bytes the staged command still expects to move.
    pub fn remaining(&self) -> usize {
        let left = self.transfer_length.saturating_sub(self.transferred) as usize;
        match self.transfer {
            Transfer::None => 0,
            Transfer::Response | Transfer::Parameters => left,
            Transfer::ReadBlocks | Transfer::WriteBlocks => left * B::BLOCK_BYTES - self.offset,
        }
    }

    /// Drops the staged command and closes any open stream.
    pub fn abort(&mut self) {
        self.close_stream();
        self.transfer = Transfer::None;
        self.transfer_length = 0;
        self.transferred = 0;
        self.offset = 0;
        self.cached = false;
    }

    /// Fills `buf` with device to host data. `Ok(0)` before [`Scsi::done`] means the
    /// block device has nothing ready yet.
    pub fn read<C: SystemClock>(&mut self, buf: &mut [u8], clock: &C) -> Result<usize, ScsiError> {
        if self.done() {
            return Ok(0);
        }
        match self.transfer {
            Transfer::Response => {
                let start = self.transferred as usize;
                let n = buf.len().min(self.transfer_length as usize - start);
                buf[..n].copy_from_slice(&self.response[start..start + n]);
                self.transferred += n as u32;
                let full_record = self.transfer_length as usize >= SENSE_LEN;
                if self.done() && full_record && self.opcode == Some(OpCode::RequestSense) {
                    self.sense = Sense::no_sense();
                }
                Ok(n)
            }
            Transfer::ReadBlocks => self.read_blocks(buf, clock),
            _ => Err(ScsiError::Structural),
        }
    }

    /// Consumes host to device data. Returns how many bytes of `data` were taken.
    pub fn write<C: SystemClock>(&mut self, data: &[u8], clock: &C) -> Result<usize, ScsiError> {
        if self.done() {
            return Ok(0);
        }
        match self.transfer {
            Transfer::Parameters => {
                // Mode parameters are accepted and dropped.
                let n = data.len().min((self.transfer_length - self.transferred) as usize);
                self.transferred += n as u32;
                Ok(n)
            }
            Transfer::WriteBlocks => self.write_blocks(data, clock),
            _ => Err(ScsiError::Structural),
        }
    }

    fn fail(&mut self, sense: Sense) -> ScsiError {
        trace_scsi!("check condition {:?} asc {:#04x}", sense.key, sense.asc);
        self.abort();
        self.sense = sense;
        ScsiError::Failed
    }

    fn close_stream(&mut self) {
        if let Some(handle) = self.stream.take() {
            self.device.close(handle);
        }
    }

    fn respond(&mut self, len: usize, alloc: u32) {
        self.transfer = Transfer::Response;
        self.transfer_length = (len as u32).min(alloc);
    }

    fn request_sense(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        // descriptor format sense
        if cdb[1] & 0x01 != 0 {
            return Err(Sense::invalid_bit_field(1, 0));
        }
        self.response[..SENSE_LEN].copy_from_slice(&self.sense.to_bytes());
        self.respond(SENSE_LEN, BigEndian::read_u16(&cdb[3..5]) as u32);
        Ok(())
    }

    fn inquiry(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        // CmdDt
        if cdb[1] & 0x02 != 0 {
            return Err(Sense::invalid_bit_field(1, 1));
        }
        let evpd = cdb[1] & 0x01 != 0;
        let page = cdb[2];
        let len = if evpd {
            self.identity.vpd(page, &mut self.response).ok_or(Sense::invalid_field(2))?
        } else if page != 0 {
            return Err(Sense::invalid_field(2));
        } else {
            self.identity.standard(&mut self.response)
        };
        self.respond(len, BigEndian::read_u16(&cdb[3..5]) as u32);
        Ok(())
    }

    fn mode_select(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        // save pages
        if cdb[1] & 0x01 != 0 {
            return Err(Sense::invalid_bit_field(1, 0));
        }
        // page format
        if cdb[1] & 0x10 != 0 {
            return Err(Sense::invalid_bit_field(1, 4));
        }
        let len = match self.opcode {
            Some(OpCode::ModeSelect6) => cdb[4] as usize,
            _ => BigEndian::read_u16(&cdb[7..9]) as usize,
        };
        // revert to defaults carries no parameter list
        if cdb[1] & 0x02 != 0 && len != 0 {
            return Err(Sense::invalid_bit_field(1, 1));
        }
        if len > MAX_PARAMETER_LIST {
            return Err(Sense::parameter_list_length());
        }
        self.transfer = Transfer::Parameters;
        self.transfer_length = len as u32;
        Ok(())
    }

    fn mode_sense(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        let ten = self.opcode == Some(OpCode::ModeSense10);
        let dbd = cdb[1] & 0x08 != 0;
        match PageControl::from_cdb(cdb[2]) {
            PageControl::Changeable => return Err(Sense::invalid_bit_field(2, 6)),
            PageControl::Saved => return Err(Sense::saving_not_supported()),
            PageControl::Current | PageControl::Default => {}
        }
        if cdb[3] != 0 {
            return Err(Sense::invalid_field(3));
        }
        let params = ModeParams {
            blocks: self.device.blocks(),
            block_len: B::BLOCK_BYTES as u32,
            read_retries: self.read_retries,
            write_retries: self.write_retries,
        };
        let len = mode::mode_sense(&mut self.response, ten, dbd, cdb[2] & 0x3F, &params)
            .ok_or(Sense::invalid_bit_field(2, 0))?;
        let alloc = if ten { BigEndian::read_u16(&cdb[7..9]) as u32 } else { cdb[4] as u32 };
        self.respond(len, alloc);
        Ok(())
    }

    fn read_format_capacities(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        let blocks = self.device.blocks();
        let r = &mut self.response[..READ_FORMAT_CAPACITIES_LEN];
        r.fill(0);
        r[3] = (READ_FORMAT_CAPACITIES_LEN - 4) as u8;
        // current/maximum capacity descriptor, then the formattable one
        BigEndian::write_u32(&mut r[4..8], blocks);
        r[8] = DESCRIPTOR_FORMATTED_MEDIA;
        BigEndian::write_u16(&mut r[10..12], B::BLOCK_BYTES as u16);
        BigEndian::write_u32(&mut r[12..16], blocks);
        BigEndian::write_u16(&mut r[18..20], B::BLOCK_BYTES as u16);
        self.respond(READ_FORMAT_CAPACITIES_LEN, BigEndian::read_u16(&cdb[7..9]) as u32);
        Ok(())
    }

    fn read_capacity(&mut self) -> Result<(), Sense> {
        BigEndian::write_u32(&mut self.response[0..4], self.device.blocks().saturating_sub(1));
        BigEndian::write_u32(&mut self.response[4..8], B::BLOCK_BYTES as u32);
        self.respond(8, u32::MAX);
        Ok(())
    }

    /// Shared range checks of Read(10) and Write(10).
    fn block_range(&self, cdb: &[u8]) -> Result<(u32, u32), Sense> {
        // RDPROTECT / WRPROTECT
        if cdb[1] & 0xE0 != 0 {
            return Err(Sense::invalid_bit_field(1, 5));
        }
        let lba = BigEndian::read_u32(&cdb[2..6]);
        let count = BigEndian::read_u16(&cdb[7..9]) as u32;
        let blocks = self.device.blocks();
        let end = lba as u64 + count as u64;
        if count == 0 || end > blocks as u64 {
            return Err(Sense::invalid_lba(lba, blocks));
        }
        Ok((lba, count))
    }

    fn read10(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        // rebuild assist recovery control
        if cdb[1] & 0x04 != 0 {
            return Err(Sense::invalid_bit_field(1, 2));
        }
        let (lba, count) = self.block_range(cdb)?;
        self.stage_blocks(Transfer::ReadBlocks, lba, count);
        Ok(())
    }

    fn write10(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        let (lba, count) = self.block_range(cdb)?;
        self.stage_blocks(Transfer::WriteBlocks, lba, count);
        Ok(())
    }

    fn stage_blocks(&mut self, transfer: Transfer, lba: u32, count: u32) {
        let dir = match transfer {
            Transfer::WriteBlocks => StreamDirection::Write,
            _ => StreamDirection::Read,
        };
        self.transfer = transfer;
        self.lba = lba;
        self.transfer_length = count;
        self.stream = self.device.open(lba, count, dir);
        trace_scsi!("{:?} lba {} count {} streaming {}", transfer, lba, count, self.stream.is_some());
    }

    fn report_luns(&mut self, cdb: &[u8]) -> Result<(), Sense> {
        let select = cdb[2];
        let len = match select {
            0x00 | 0x02 | 0x11 => 16,
            0x01 | 0x10 | 0x12 => 8,
            _ => return Err(Sense::invalid_field(2)),
        };
        self.response[..len].fill(0);
        if len == 16 {
            // one eight byte entry for LUN 0
            BigEndian::write_u32(&mut self.response[0..4], 8);
        }
        self.respond(len, BigEndian::read_u32(&cdb[6..10]));
        Ok(())
    }

    /// Moves the position forward by `n` bytes of block data.
    fn advance(&mut self, n: usize) {
        self.offset += n;
        if self.offset >= B::BLOCK_BYTES {
            self.transferred += (self.offset / B::BLOCK_BYTES) as u32;
            self.offset %= B::BLOCK_BYTES;
            self.cached = false;
        }
        if self.done() {
            self.close_stream();
        }
    }

    fn current_lba(&self) -> u32 { self.lba + self.transferred }

    fn load_block<C: SystemClock>(&mut self, clock: &C) -> Result<(), ScsiError> {
        let lba = self.current_lba();
        let device = &mut self.device;
        let block = &mut self.block[..B::BLOCK_BYTES];
        match with_retry(clock, self.read_retries, self.recovery_time_ms, || device.read_block(lba, &mut block[..])) {
            Ok(()) => {
                self.cached = true;
                Ok(())
            }
            Err(tries) => {
                log::error!("unrecoverable read at lba {} after {} tries", lba, tries);
                Err(self.fail(Sense::read_error(lba, tries)))
            }
        }
    }

    fn store_block<C: SystemClock>(&mut self, clock: &C) -> Result<(), ScsiError> {
        let lba = self.current_lba();
        let device = &mut self.device;
        let block = &self.block[..B::BLOCK_BYTES];
        match with_retry(clock, self.write_retries, self.recovery_time_ms, || device.write_block(lba, block)) {
            Ok(()) => Ok(()),
            Err(tries) => {
                log::error!("unrecoverable write at lba {} after {} tries", lba, tries);
                Err(self.fail(Sense::write_error(lba, tries)))
            }
        }
    }

    fn read_blocks<C: SystemClock>(&mut self, buf: &mut [u8], clock: &C) -> Result<usize, ScsiError> {
        let buf_len = buf.len().min(self.remaining());
        let buf = &mut buf[..buf_len];
        if let Some(handle) = self.stream {
            match self.device.read(handle, buf) {
                Ok(n) => {
                    self.advance(n);
                    return Ok(n);
                }
                Err(e) => {
                    log::warn!("stream read failed at lba {}: {:?}, continuing block by block", self.current_lba(), e);
                    self.close_stream();
                }
            }
        }

        let mut n = 0;
        while n < buf.len() && !self.done() {
            if !self.cached {
                self.load_block(clock)?;
            }
            let cpy = (B::BLOCK_BYTES - self.offset).min(buf.len() - n);
            buf[n..n + cpy].copy_from_slice(&self.block[self.offset..self.offset + cpy]);
            n += cpy;
            self.advance(cpy);
        }
        Ok(n)
    }

    fn write_blocks<C: SystemClock>(&mut self, data: &[u8], clock: &C) -> Result<usize, ScsiError> {
        let data = &data[..data.len().min(self.remaining())];
        let mut n = 0;
        if let Some(handle) = self.stream {
            match self.device.write(handle, data) {
                Ok(taken) if taken == data.len() => {
                    self.advance(taken);
                    return Ok(taken);
                }
                Ok(taken) => {
                    log::warn!("stream took {} of {} bytes, continuing block by block", taken, data.len());
                    self.close_stream();
                    self.advance(taken);
                    n = taken;
                }
                Err(e) => {
                    log::warn!("stream write failed at lba {}: {:?}, continuing block by block", self.current_lba(), e);
                    self.close_stream();
                }
            }
        }

        while n < data.len() && !self.done() {
            if !self.cached {
                // The head of a partly streamed block must be read back before it is rewritten.
                if self.offset != 0 {
                    self.load_block(clock)?;
                }
                self.cached = true;
            }
            let cpy = (B::BLOCK_BYTES - self.offset).min(data.len() - n);
            self.block[self.offset..self.offset + cpy].copy_from_slice(&data[n..n + cpy]);
            n += cpy;
            if self.offset + cpy == B::BLOCK_BYTES {
                self.store_block(clock)?;
            }
            self.advance(cpy);
        }
        Ok(n)
    }
}
