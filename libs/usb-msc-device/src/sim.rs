//! Host-side simulation: mock SIE registers, interrupt line and clock, plus a
//! host that plays the SIE's part on the buffer descriptor table so whole
//! enumerations and Bulk-Only transactions run without hardware.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::bdt::{BdTable, Bdt, TokenPid};
use crate::endpoint::{Bank, Direction};
use crate::hw::{Endpt, InterruptLine, Istat, Reg, Sie, SystemClock};
use crate::packet::PacketStorage;
use crate::{Config, Packet, RamDisk, Usb, EP_NUM_CNT, MAX_PKT_SIZE};

const REG_SPACE: usize = 0x110;

#[derive(Clone)]
pub(crate) struct MockSie {
    regs: Rc<RefCell<[u8; REG_SPACE]>>,
    /// Completed tokens behind the one STAT currently shows.
    stat_fifo: Rc<RefCell<VecDeque<u8>>>,
}

impl MockSie {
    pub fn new() -> MockSie {
        MockSie { regs: Rc::new(RefCell::new([0; REG_SPACE])), stat_fifo: Rc::new(RefCell::new(VecDeque::new())) }
    }

    /// Queues a completed token. It reaches STAT, with TOKDNE raised again, once
    /// the current TOKDNE is cleared.
    pub fn queue_token(&self, stat: u8) { self.stat_fifo.borrow_mut().push_back(stat) }

    pub fn get(&self, reg: Reg) -> u8 { self.regs.borrow()[reg.offset()] }

    /// Stores `value` the way the hardware would, bypassing write-one-to-clear.
    pub fn set(&self, reg: Reg, value: u8) { self.regs.borrow_mut()[reg.offset()] = value }

    /// Sets status bits as the hardware would.
    pub fn raise(&self, reg: Reg, bits: u8) { self.regs.borrow_mut()[reg.offset()] |= bits }
}

impl Sie for MockSie {
    fn read(&self, reg: Reg) -> u8 { self.get(reg) }

    fn write(&self, reg: Reg, value: u8) {
        let mut regs = self.regs.borrow_mut();
        match reg {
            Reg::Istat => {
                let was = regs[reg.offset()];
                regs[reg.offset()] &= !value;
                if was & value & Istat::TOKDNE != 0 {
                    if let Some(stat) = self.stat_fifo.borrow_mut().pop_front() {
                        regs[Reg::Stat.offset()] = stat;
                        regs[reg.offset()] |= Istat::TOKDNE;
                    }
                }
            }
            Reg::Errstat => regs[reg.offset()] &= !value,
            _ => regs[reg.offset()] = value,
        }
    }
}

#[derive(Default)]
struct IrqState {
    enabled: Cell<bool>,
    priority: Cell<u8>,
    disables: Cell<u32>,
}

#[derive(Clone, Default)]
pub(crate) struct MockIrq {
    state: Rc<IrqState>,
}

impl MockIrq {
    pub fn new() -> MockIrq { MockIrq::default() }

    pub fn enabled(&self) -> bool { self.state.enabled.get() }

    pub fn priority(&self) -> u8 { self.state.priority.get() }

    pub fn disable_count(&self) -> u32 { self.state.disables.get() }
}

impl InterruptLine for MockIrq {
    fn enable(&mut self) { self.state.enabled.set(true) }

    fn disable(&mut self) {
        self.state.enabled.set(false);
        self.state.disables.set(self.state.disables.get() + 1);
    }

    fn set_priority(&mut self, priority: u8) { self.state.priority.set(priority) }
}

#[derive(Clone, Default)]
pub(crate) struct MockClock {
    now: Rc<Cell<u32>>,
    gated: Rc<Cell<bool>>,
}

impl MockClock {
    pub fn new() -> MockClock { MockClock::default() }

    pub fn advance(&self, ms: u32) { self.now.set(self.now.get().wrapping_add(ms)) }

    pub fn usb_gated(&self) -> bool { self.gated.get() }
}

impl SystemClock for MockClock {
    fn gate_usb(&mut self, on: bool) { self.gated.set(on) }

    fn millis(&self) -> u32 { self.now.get() }
}

pub(crate) type SimUsb = Usb<MockSie, MockIrq, MockClock, RamDisk<'static>>;

/// How the device answered a token it did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    Nak,
    Stall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

/// Tokens retried on NAK before a test gives up.
const NAK_LIMIT: usize = 256;

pub(crate) struct Host {
    pub usb: SimUsb,
    pub sie: MockSie,
    pub clock: MockClock,
    /// Bank the SIE uses next, per endpoint number and direction.
    next_bank: [[Bank; 2]; EP_NUM_CNT],
    /// DATA0/1 the host puts on (or expects from) the next packet.
    toggle: [[bool; 2]; EP_NUM_CNT],
    /// Packets whose DATA0/1 did not match what the host expected.
    pub toggle_errors: u32,
    /// DATA0/1 of every bulk IN packet, oldest first.
    pub bulk_in_toggles: Vec<bool>,
    /// DATA0/1 the device armed for every bulk OUT packet it took, oldest first.
    pub bulk_out_toggles: Vec<bool>,
    tag: u32,
}

impl Host {
    /// A device with `blocks` blocks of RAM disk, attached and bus reset.
    pub fn new(blocks: usize) -> Host { Host::with_disk(RamDisk::new(Box::leak(vec![0u8; blocks * 512].into_boxed_slice()))) }

    pub fn with_disk(disk: RamDisk<'static>) -> Host { Host::with_config(disk, &Config::default()) }

    pub fn with_config(disk: RamDisk<'static>, config: &Config) -> Host {
        let _ = env_logger::builder().is_test(true).try_init();
        let sie = MockSie::new();
        let clock = MockClock::new();
        let table: &'static BdTable = Box::leak(Box::new(BdTable::new()));
        let packets: &'static mut PacketStorage = Box::leak(Box::new(core::array::from_fn(|_| Packet::new())));
        let mut usb = Usb::new(sie.clone(), table, packets, MockIrq::new(), clock.clone(), disk, config)
            .expect("device");
        usb.attach();
        let mut host = Host {
            usb,
            sie,
            clock,
            next_bank: [[Bank::Even; 2]; EP_NUM_CNT],
            toggle: [[false; 2]; EP_NUM_CNT],
            toggle_errors: 0,
            bulk_in_toggles: Vec::new(),
            bulk_out_toggles: Vec::new(),
            tag: 0,
        };
        host.bus_reset();
        host
    }

    pub fn bus_reset(&mut self) {
        self.sie.raise(Reg::Istat, Istat::USBRST);
        self.usb.isr();
        self.next_bank = [[Bank::Even; 2]; EP_NUM_CNT];
        self.toggle = [[false; 2]; EP_NUM_CNT];
    }

    /// Host toggles restart at DATA0 for `num` (after Set Configuration or a
    /// cleared halt).
    pub fn reset_toggle(&mut self, num: u8, dir: Direction) { self.toggle[num as usize][dir as usize] = false }

    /// One token as the SIE would handle it.
    pub fn token(&mut self, num: u8, pid: TokenPid, data: &[u8]) -> Result<Vec<u8>, Handshake> {
        let dir = if pid == TokenPid::In { Direction::In } else { Direction::Out };
        let (n, d) = (num as usize, dir as usize);
        let bank = self.next_bank[n][d];
        let index = Bdt::index(num, dir, bank);
        let endpt = Endpt(self.sie.get(Reg::Endpt(num)));
        let enabled = if dir == Direction::In { endpt.eptxen() } else { endpt.eprxen() };
        if !enabled {
            return Err(Handshake::Nak);
        }
        if pid != TokenPid::Setup && endpt.epstall() {
            return Err(self.stall_handshake());
        }

        let ctl = self.usb.bus_mut().bdt.entry(index).control();
        if !ctl.own() {
            return Err(Handshake::Nak);
        }
        if ctl.bdt_stall() && pid != TokenPid::Setup {
            return Err(self.stall_handshake());
        }
        let id = self.usb.bus_mut().bdt.owner(index).expect("slot armed without a packet");

        if pid == TokenPid::Setup {
            self.toggle[n] = [false, false];
        }
        if ctl.data1() != self.toggle[n][d] {
            log::warn!("ep{} {:?}: DATA{} where DATA{} expected", num, dir, ctl.data1() as u8, self.toggle[n][d] as u8);
            self.toggle_errors += 1;
        }
        self.toggle[n][d] = !self.toggle[n][d];
        if pid == TokenPid::Setup {
            // Data and Status stages both begin with DATA1
            self.toggle[n] = [true, true];
        }

        let bus = self.usb.bus_mut();
        let reply = match dir {
            Direction::In => {
                let count = ctl.byte_count() as usize;
                bus.pool.packet(id).buf[..count].to_vec()
            }
            Direction::Out => {
                assert!(data.len() <= ctl.byte_count() as usize, "OUT larger than the armed buffer");
                bus.pool.packet_mut(id).buf[..data.len()].copy_from_slice(data);
                Vec::new()
            }
        };
        let count = if dir == Direction::In { reply.len() } else { data.len() };
        bus.bdt.entry(index).complete(pid, count);
        if num == 1 {
            match dir {
                Direction::In => self.bulk_in_toggles.push(ctl.data1()),
                Direction::Out => self.bulk_out_toggles.push(ctl.data1()),
            }
        }
        self.next_bank[n][d] = bank.other();

        let odd = (bank == Bank::Odd) as u8;
        self.sie.set(Reg::Stat, num << 4 | (d as u8) << 3 | odd << 2);
        self.sie.raise(Reg::Istat, Istat::TOKDNE);
        self.usb.isr();
        Ok(reply)
    }

    fn stall_handshake(&mut self) -> Handshake {
        self.sie.raise(Reg::Istat, Istat::STALL);
        self.usb.isr();
        Handshake::Stall
    }

    /// Retries a token through NAKs, letting the main loop run in between.
    pub fn poll(&mut self, num: u8, pid: TokenPid, data: &[u8]) -> Result<Vec<u8>, Handshake> {
        for _ in 0..NAK_LIMIT {
            match self.token(num, pid, data) {
                Err(Handshake::Nak) => self.usb.process(),
                other => return other,
            }
        }
        Err(Handshake::Nak)
    }

    pub fn setup(&mut self, raw: [u8; 8]) {
        self.poll(0, TokenPid::Setup, &raw).expect("setup accepted");
        self.usb.process();
    }

    /// Control read: Setup, IN Data stage until short or wLength, OUT Status.
    pub fn control_in(&mut self, raw: [u8; 8]) -> Result<Vec<u8>, Handshake> {
        let length = LittleEndian::read_u16(&raw[6..8]) as usize;
        self.setup(raw);
        let mut data = Vec::new();
        loop {
            let pkt = self.poll(0, TokenPid::In, &[])?;
            data.extend_from_slice(&pkt);
            if pkt.len() < MAX_PKT_SIZE || data.len() >= length {
                break;
            }
        }
        self.poll(0, TokenPid::Out, &[])?;
        Ok(data)
    }

    /// Control write without data: Setup then IN Status.
    pub fn control_out(&mut self, raw: [u8; 8]) -> Result<(), Handshake> {
        self.setup(raw);
        let status = self.poll(0, TokenPid::In, &[])?;
        assert!(status.is_empty(), "status stage carried data");
        Ok(())
    }

    /// Address 5, configuration 1.
    pub fn enumerate(&mut self) {
        self.control_in([0x80, 0x06, 0x00, 0x01, 0, 0, 64, 0]).expect("device descriptor");
        self.control_out([0x00, 0x05, 5, 0, 0, 0, 0, 0]).expect("set address");
        self.control_out([0x00, 0x09, 1, 0, 0, 0, 0, 0]).expect("set configuration");
        self.reset_toggle(1, Direction::In);
        self.reset_toggle(1, Direction::Out);
    }

    pub fn bulk_out(&mut self, data: &[u8]) -> Result<(), Handshake> { self.poll(1, TokenPid::Out, data).map(|_| ()) }

    pub fn bulk_in(&mut self) -> Result<Vec<u8>, Handshake> { self.poll(1, TokenPid::In, &[]) }

    /// Sends a CBW and returns its tag.
    pub fn cbw(&mut self, cdb: &[u8], length: u32, dir_in: bool) -> u32 {
        self.tag = self.tag.wrapping_add(1);
        let mut raw = [0u8; 31];
        LittleEndian::write_u32(&mut raw[0..4], 0x43425355);
        LittleEndian::write_u32(&mut raw[4..8], self.tag);
        LittleEndian::write_u32(&mut raw[8..12], length);
        raw[12] = if dir_in { 0x80 } else { 0 };
        raw[14] = cdb.len() as u8;
        raw[15..15 + cdb.len()].copy_from_slice(cdb);
        self.bulk_out(&raw).expect("CBW accepted");
        self.tag
    }

    pub fn csw(&mut self) -> Csw {
        let raw = self.bulk_in().expect("CSW");
        assert_eq!(raw.len(), 13, "CSW length");
        assert_eq!(LittleEndian::read_u32(&raw[0..4]), 0x53425355);
        Csw { tag: LittleEndian::read_u32(&raw[4..8]), residue: LittleEndian::read_u32(&raw[8..12]), status: raw[12] }
    }

    /// Device to host command: data until `length` or a short packet, then CSW.
    pub fn command_in(&mut self, cdb: &[u8], length: u32) -> (Vec<u8>, Csw) {
        let tag = self.cbw(cdb, length, true);
        let mut data = Vec::new();
        if length != 0 {
            loop {
                let pkt = self.bulk_in().expect("data IN");
                data.extend_from_slice(&pkt);
                if pkt.len() < MAX_PKT_SIZE || data.len() >= length as usize {
                    break;
                }
            }
        }
        let csw = self.csw();
        assert_eq!(csw.tag, tag);
        (data, csw)
    }

    /// Host to device command carrying `data`, then CSW.
    pub fn command_out(&mut self, cdb: &[u8], data: &[u8]) -> Csw {
        let tag = self.cbw(cdb, data.len() as u32, false);
        for chunk in data.chunks(MAX_PKT_SIZE) {
            self.bulk_out(chunk).expect("data OUT");
        }
        let csw = self.csw();
        assert_eq!(csw.tag, tag);
        csw
    }
}

pub(crate) fn read10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    cdb
}

pub(crate) fn write10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::State;
    use crate::DeviceState;

    const REQUEST_SENSE: [u8; 6] = [0x03, 0, 0, 0, 18, 0];

    #[test]
    fn device_descriptor_reports_one_configuration() {
        let mut host = Host::new(16);
        let d = host.control_in([0x80, 0x06, 0x00, 0x01, 0, 0, 0xFF, 0]).unwrap();
        assert_eq!(d.len(), 18);
        assert_eq!(d[0], 18);
        assert_eq!(d[1], 1);
        assert_eq!(d[7], 64);
        assert_eq!(d[17], 1);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn descriptor_is_truncated_to_wlength() {
        let mut host = Host::new(16);
        let d = host.control_in([0x80, 0x06, 0x00, 0x02, 0, 0, 9, 0]).unwrap();
        assert_eq!(d, vec![9, 2, 32, 0, 1, 1, 0, 0x80, 50]);
    }

    #[test]
    fn unsupported_request_stalls_then_next_setup_is_accepted() {
        let mut host = Host::new(16);
        // vendor request
        assert_eq!(host.control_in([0xC0, 0x01, 0, 0, 0, 0, 8, 0]), Err(Handshake::Stall));
        // recipient Other
        assert_eq!(host.control_out([0x03, 0x03, 0, 0, 0, 0, 0, 0]), Err(Handshake::Stall));
        // unknown standard request
        assert_eq!(host.control_in([0x80, 0x04, 0, 0, 0, 0, 2, 0]), Err(Handshake::Stall));
        let d = host.control_in([0x80, 0x06, 0x00, 0x01, 0, 0, 18, 0]).unwrap();
        assert_eq!(d.len(), 18);
    }

    #[test]
    fn set_address_waits_for_status_stage() {
        let mut host = Host::new(16);
        assert_eq!(host.usb.state(), DeviceState::Default);
        host.setup([0x00, 0x05, 5, 0, 0, 0, 0, 0]);
        assert_eq!(host.sie.get(Reg::Addr), 0);
        assert_eq!(host.usb.state(), DeviceState::Default);
        assert_eq!(host.poll(0, TokenPid::In, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(host.sie.get(Reg::Addr), 5);
        assert_eq!(host.usb.state(), DeviceState::Address);
    }

    #[test]
    fn configuration_lifecycle() {
        let mut host = Host::new(16);
        // not allowed in Default state
        assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]), Err(Handshake::Stall));
        host.enumerate();
        assert_eq!(host.usb.state(), DeviceState::Configured);
        assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]).unwrap(), vec![1]);
        assert_eq!(host.control_in([0x81, 0x0A, 0, 0, 0, 0, 1, 0]).unwrap(), vec![0]);
        assert_eq!(host.control_out([0x00, 0x09, 2, 0, 0, 0, 0, 0]), Err(Handshake::Stall));
        assert_eq!(host.control_out([0x00, 0x05, 7, 0, 0, 0, 0, 0]), Err(Handshake::Stall));

        host.control_out([0x00, 0x09, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(host.usb.state(), DeviceState::Address);
        assert_eq!(Endpt(host.sie.get(Reg::Endpt(1))).0, 0);
        assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]).unwrap(), vec![0]);
    }

    #[test]
    fn status_and_class_requests() {
        let mut host = Host::new(16);
        host.enumerate();
        assert_eq!(host.control_in([0x80, 0x00, 0, 0, 0, 0, 2, 0]).unwrap(), vec![0, 0]);
        host.control_out([0x00, 0x03, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(host.control_in([0x80, 0x00, 0, 0, 0, 0, 2, 0]).unwrap(), vec![2, 0]);
        assert_eq!(host.control_in([0x81, 0x00, 0, 0, 0, 0, 2, 0]).unwrap(), vec![0, 0]);
        assert_eq!(host.control_in([0x82, 0x00, 0, 0, 0x81, 0, 2, 0]).unwrap(), vec![0, 0]);
        assert_eq!(host.control_in([0x82, 0x00, 0, 0, 0x82, 0, 2, 0]), Err(Handshake::Stall));
        assert_eq!(host.control_in([0xA1, 0xFE, 0, 0, 0, 0, 1, 0]).unwrap(), vec![0]);
        host.control_out([0x21, 0xFF, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(host.control_in([0x80, 0x06, 0x00, 0x03, 0, 0, 0xFF, 0]).unwrap(), vec![4, 3, 0x09, 0x04]);
        assert_eq!(host.control_in([0x80, 0x06, 0x04, 0x03, 0x09, 0x04, 0xFF, 0]), Err(Handshake::Stall));
        let s = host.control_in([0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xFF, 0]).unwrap();
        assert_eq!(s[0] as usize, s.len());
        assert_eq!(&s[2..6], &[b'B', 0, b'o', 0]);
    }

    #[test]
    fn test_unit_ready_yields_one_passing_csw() {
        let mut host = Host::new(16);
        host.enumerate();
        let (data, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert!(data.is_empty());
        assert_eq!(csw.status, 0);
        assert_eq!(csw.residue, 0);
        assert_eq!(host.usb.interface().state(), State::Command);
        // nothing further is queued on bulk IN
        assert_eq!(host.token(1, TokenPid::In, &[]), Err(Handshake::Nak));
    }

    #[test]
    fn read_past_capacity_fails_with_full_residue_and_lba_sense() {
        let mut host = Host::new(16);
        host.enumerate();
        let (data, csw) = host.command_in(&read10(15, 2), 1024);
        assert!(data.is_empty());
        assert_eq!(csw.status, 1);
        assert_eq!(csw.residue, 1024);

        let (sense, csw) = host.command_in(&REQUEST_SENSE, 18);
        assert_eq!(csw.status, 0);
        assert_eq!(sense[2], 0x05);
        assert_eq!(sense[12], 0x21);
        assert_eq!(&sense[3..7], &[0, 0, 0, 15]);
    }

    #[test]
    fn request_sense_consumes_latched_record() {
        let mut host = Host::new(16);
        host.enumerate();
        let (_, csw) = host.command_in(&[0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 1);
        let (first, _) = host.command_in(&REQUEST_SENSE, 18);
        assert_eq!(first[2], 0x05);
        assert_eq!(first[12], 0x20);
        let (second, _) = host.command_in(&REQUEST_SENSE, 18);
        assert_eq!(second, vec![0x70, 0, 0, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 0x80, 0, 0]);
    }

    #[test]
    fn inquiry_serial_number_page() {
        let mut host = Host::new(16);
        host.enumerate();
        let (page, csw) = host.command_in(&[0x12, 0x01, 0x80, 0, 255, 0], 255);
        assert_eq!(page.len(), 20);
        assert_eq!(&page[4..], b"0000000000000001");
        assert_eq!(csw.status, 0);
        assert_eq!(csw.residue, 235);

        let (page, csw) = host.command_in(&[0x12, 0x01, 0x80, 0, 8, 0], 8);
        assert_eq!(page.len(), 8);
        assert_eq!(csw.residue, 0);
    }

    #[test]
    fn write_then_read_back_four_blocks() {
        let mut host = Host::new(16);
        host.enumerate();
        let data: Vec<u8> = (0..4 * 512).map(|i| (i * 13 + 7) as u8).collect();
        let csw = host.command_out(&write10(3, 4), &data);
        assert_eq!(csw.status, 0);
        assert_eq!(csw.residue, 0);
        assert_eq!(&host.usb.device().as_slice()[3 * 512..7 * 512], &data[..]);

        let (back, csw) = host.command_in(&read10(3, 4), 2048);
        assert_eq!(csw.status, 0);
        assert_eq!(back, data);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn streaming_disk_serves_reads_and_writes() {
        let disk = RamDisk::with_streaming(Box::leak(vec![0u8; 16 * 512].into_boxed_slice()));
        let mut host = Host::with_disk(disk);
        host.enumerate();
        let data: Vec<u8> = (0..2 * 512).map(|i| (i % 251) as u8).collect();
        assert_eq!(host.command_out(&write10(8, 2), &data).status, 0);
        let (back, csw) = host.command_in(&read10(8, 2), 1024);
        assert_eq!(csw.residue, 0);
        assert_eq!(back, data);
    }

    #[test]
    fn bulk_in_toggles_alternate_from_data0() {
        let mut host = Host::new(16);
        host.enumerate();
        let (_, csw) = host.command_in(&read10(0, 2), 1024);
        assert_eq!(csw.status, 0);
        // 16 data packets and the CSW
        assert_eq!(host.bulk_in_toggles.len(), 17);
        for (i, data1) in host.bulk_in_toggles.iter().enumerate() {
            assert_eq!(*data1, i % 2 == 1, "packet {}", i);
        }
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn medium_error_after_retries_is_reported_through_sense() {
        let mut host = Host::new(16);
        host.enumerate();
        host.usb.device_mut().fail_block_reads = 10;
        let (data, csw) = host.command_in(&read10(4, 1), 512);
        assert!(data.is_empty());
        assert_eq!(csw.status, 1);
        assert_eq!(csw.residue, 512);
        let (sense, _) = host.command_in(&REQUEST_SENSE, 18);
        assert_eq!(sense[2], 0x03);
        assert_eq!(sense[12], 0x11);
        assert_eq!(&sense[15..18], &[0x80, 0, 10]);
    }

    #[test]
    fn invalid_cbw_stalls_bulk_in_until_halt_cleared() {
        let mut host = Host::new(16);
        host.enumerate();
        host.bulk_out(&[0u8; 30]).unwrap();
        assert_eq!(host.bulk_in(), Err(Handshake::Stall));
        assert_eq!(host.control_in([0x82, 0x00, 0, 0, 0x81, 0, 2, 0]).unwrap(), vec![1, 0]);

        host.control_out([0x02, 0x01, 0, 0, 0x81, 0, 0, 0]).unwrap();
        host.reset_toggle(1, Direction::In);
        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn mass_storage_reset_abandons_data_phase() {
        let mut host = Host::new(16);
        host.enumerate();
        let tag = host.cbw(&write10(0, 2), 1024, false);
        host.bulk_out(&[0xAA; 64]).unwrap();
        host.usb.process();
        assert_eq!(host.usb.interface().state(), State::Data);
        // more of the abandoned data arrives before the reset
        for _ in 0..3 {
            host.bulk_out(&[0xAA; 64]).unwrap();
        }
        assert_eq!(host.usb.bus_mut().bulk_out.pending(), 3);
        host.control_out([0x21, 0xFF, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(host.usb.interface().state(), State::Command);
        assert_eq!(host.usb.bus_mut().bulk_out.pending(), 0);

        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_ne!(csw.tag, tag);
        assert_eq!(csw.status, 0);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn failed_write_discards_the_announced_data() {
        let mut host = Host::new(4);
        host.enumerate();
        let csw = host.command_out(&write10(10, 2), &[0x55; 1024]);
        assert_eq!(csw.status, 1);
        assert_eq!(csw.residue, 1024);
        assert!(host.usb.device().as_slice().iter().all(|&b| b == 0));

        let (sense, _) = host.command_in(&REQUEST_SENSE, 18);
        assert_eq!(sense[2], 0x05);
        assert_eq!(sense[12], 0x21);
        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn surplus_out_data_is_discarded_with_residue() {
        let mut host = Host::new(16);
        host.enumerate();
        let data: Vec<u8> = (0..1024).map(|i| i as u8).collect();
        let csw = host.command_out(&write10(2, 1), &data);
        assert_eq!(csw.status, 0);
        assert_eq!(csw.residue, 512);
        assert_eq!(&host.usb.device().as_slice()[2 * 512..3 * 512], &data[..512]);
        assert_eq!(host.usb.device().as_slice()[3 * 512], 0);
        assert_eq!(host.usb.interface().state(), State::Command);
    }

    #[test]
    fn bulk_out_toggles_alternate_from_data0() {
        let mut host = Host::new(16);
        host.enumerate();
        let csw = host.command_out(&write10(0, 4), &[0x3C; 2048]);
        assert_eq!(csw.status, 0);
        // the CBW and 32 data packets
        assert_eq!(host.bulk_out_toggles.len(), 33);
        for (i, data1) in host.bulk_out_toggles.iter().enumerate() {
            assert_eq!(*data1, i % 2 == 1, "packet {}", i);
        }
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn bulk_out_naks_once_the_receive_queue_backs_up() {
        let mut host = Host::new(16);
        host.enumerate();
        host.cbw(&write10(0, 4), 2048, false);
        let mut accepted = 0;
        while host.token(1, TokenPid::Out, &[0x3C; 64]).is_ok() {
            accepted += 1;
        }
        // eight waiting packets stop the re-arming; the other bank takes one more
        assert_eq!(accepted, 8);
        assert_eq!(host.usb.bus_mut().bulk_out.pending(), 9);

        for _ in accepted..32 {
            host.bulk_out(&[0x3C; 64]).unwrap();
        }
        let csw = host.csw();
        assert_eq!(csw.status, 0);
        assert_eq!(csw.residue, 0);
        assert!(host.usb.device().as_slice()[..2048].iter().all(|&b| b == 0x3C));
    }

    #[test]
    fn control_data_stage_spans_packets() {
        // 31 characters: a 64-byte string descriptor
        let config = Config { product: "ABCDEFGHIJKLMNOPQRSTUVWXYZ01234", ..Config::default() };
        let mut host = Host::with_config(RamDisk::new(Box::leak(vec![0u8; 512].into_boxed_slice())), &config);
        let get_product = |length: u8| [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, length, 0];

        host.setup(get_product(0xFF));
        let first = host.poll(0, TokenPid::In, &[]).unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first[0], 64);
        // shorter than wLength and a whole number of packets: ends with a ZLP
        assert_eq!(host.poll(0, TokenPid::In, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(host.poll(0, TokenPid::Out, &[]).unwrap(), Vec::<u8>::new());

        // exactly wLength: no ZLP, the Status stage follows the full packet
        host.setup(get_product(64));
        assert_eq!(host.poll(0, TokenPid::In, &[]).unwrap().len(), 64);
        assert_eq!(host.poll(0, TokenPid::Out, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(host.token(0, TokenPid::In, &[]), Err(Handshake::Nak));

        let config = Config { product: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789abcd", ..Config::default() };
        let mut host = Host::with_config(RamDisk::new(Box::leak(vec![0u8; 512].into_boxed_slice())), &config);
        let s = host.control_in(get_product(0xFF)).unwrap();
        assert_eq!(s.len(), 82);
        assert_eq!(s[0], 82);
        assert_eq!(&s[80..82], &[b'd', 0]);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn string_requests_need_matching_language() {
        let mut host = Host::new(16);
        assert_eq!(host.control_in([0x80, 0x06, 0x01, 0x03, 0, 0, 0xFF, 0]), Err(Handshake::Stall));
        assert_eq!(host.control_in([0x80, 0x06, 0x01, 0x03, 0x07, 0x04, 0xFF, 0]), Err(Handshake::Stall));
        assert_eq!(host.control_in([0x80, 0x06, 0x00, 0x03, 0x09, 0x04, 0xFF, 0]), Err(Handshake::Stall));
        let s = host.control_in([0x80, 0x06, 0x01, 0x03, 0x09, 0x04, 0xFF, 0]).unwrap();
        assert_eq!(s, vec![8, 3, b'K', 0, b'T', 0, b'W', 0]);
    }

    #[test]
    fn set_configuration_again_restarts_bulk_toggles() {
        let mut host = Host::new(16);
        host.enumerate();
        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);

        host.control_out([0x00, 0x09, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(host.usb.state(), DeviceState::Configured);
        assert_eq!(host.control_in([0x80, 0x08, 0, 0, 0, 0, 1, 0]).unwrap(), vec![1]);
        host.reset_toggle(1, Direction::In);
        host.reset_toggle(1, Direction::Out);

        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);
        assert_eq!(host.bulk_out_toggles, vec![false, false]);
        assert_eq!(host.bulk_in_toggles, vec![false, false]);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn endpoint_halt_is_reported_by_get_status() {
        let mut host = Host::new(16);
        host.enumerate();
        for ep in [0x81u8, 0x01] {
            assert_eq!(host.control_in([0x82, 0x00, 0, 0, ep, 0, 2, 0]).unwrap(), vec![0, 0]);
            host.control_out([0x02, 0x03, 0, 0, ep, 0, 0, 0]).unwrap();
            assert_eq!(host.control_in([0x82, 0x00, 0, 0, ep, 0, 2, 0]).unwrap(), vec![1, 0]);
        }
        assert_eq!(host.bulk_in(), Err(Handshake::Stall));
        assert_eq!(host.bulk_out(&[0u8; 31]), Err(Handshake::Stall));

        for ep in [0x81u8, 0x01] {
            host.control_out([0x02, 0x01, 0, 0, ep, 0, 0, 0]).unwrap();
            assert_eq!(host.control_in([0x82, 0x00, 0, 0, ep, 0, 2, 0]).unwrap(), vec![0, 0]);
        }
        host.reset_toggle(1, Direction::In);
        host.reset_toggle(1, Direction::Out);
        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);
        assert_eq!(host.toggle_errors, 0);
    }

    #[test]
    fn bus_reset_unconfigures_and_releases_packets() {
        let mut host = Host::new(16);
        host.enumerate();
        host.bus_reset();
        assert_eq!(host.usb.state(), DeviceState::Default);
        assert_eq!(Endpt(host.sie.get(Reg::Endpt(1))).0, 0);
        // only the two reserved control packets stay out of the pool
        assert_eq!(host.usb.bus_mut().pool.available(), crate::NUM_PACKETS - 2);
        host.enumerate();
        let (_, csw) = host.command_in(&[0, 0, 0, 0, 0, 0], 0);
        assert_eq!(csw.status, 0);
    }

    #[test]
    fn start_of_frame_keeps_device_active_during_transfers() {
        let mut host = Host::new(16);
        host.enumerate();
        host.clock.advance(20);
        host.sie.raise(Reg::Istat, Istat::SOFTOK);
        host.usb.isr();
        let (_, csw) = host.command_in(&read10(0, 1), 512);
        assert_eq!(csw.status, 0);
        assert!(host.usb.active());
        host.clock.advance(1001);
        assert!(!host.usb.active());
    }

    #[test]
    fn capacity_commands_describe_the_disk() {
        let mut host = Host::new(16);
        host.enumerate();
        let (cap, _) = host.command_in(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], 8);
        assert_eq!(cap, vec![0, 0, 0, 15, 0, 0, 2, 0]);
        let (fmt, _) = host.command_in(&[0x23, 0, 0, 0, 0, 0, 0, 0, 0xFC, 0], 0xFC);
        assert_eq!(fmt.len(), 20);
        assert_eq!(&fmt[4..9], &[0, 0, 0, 16, 2]);
        let (mode, _) = host.command_in(&[0x1A, 0, 0x3F, 0, 0xC0, 0], 0xC0);
        assert_eq!(mode[0] as usize, mode.len() - 1);
    }
}
