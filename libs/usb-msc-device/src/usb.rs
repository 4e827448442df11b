//! The device object: owns the SIE, the endpoints, the control pipe and the
//! Bulk-Only interface, and ties them to the interrupt line.
use crate::bdt::BdTable;
use crate::block_device::BlockDevice;
use crate::bot::BulkOnlyIface;
use crate::bus::Endpoints;
use crate::config::Config;
use crate::control::{ControlPipe, DeviceStatus, InterfaceAction};
use crate::descriptors::Descriptors;
use crate::error::Error;
use crate::hw::{Ctl, ErrStat, InterruptLine, Istat, Reg, Sie, Stat, SystemClock, CONTROL_DPPULLUPNONOTG};
use crate::logging::*;
use crate::packet::PacketStorage;
use crate::scsi::Scsi;

pub use crate::control::DeviceState;

/// A SOF seen this recently means the host is talking to us.
const ACTIVITY_WINDOW_MS: u32 = 1000;

const INTEN_RUNNING: u8 =
    Istat::USBRST | Istat::ERROR | Istat::SOFTOK | Istat::TOKDNE | Istat::SLEEP | Istat::STALL;

pub struct Usb<S: Sie, I: InterruptLine, C: SystemClock, B: BlockDevice> {
    bus: Endpoints<S>,
    control: ControlPipe,
    iface: BulkOnlyIface<B>,
    status: DeviceStatus,
    irq: I,
    clock: C,
    irq_priority: u8,
    last_sof: Option<u32>,
}

impl<S: Sie, I: InterruptLine, C: SystemClock, B: BlockDevice> Usb<S, I, C, B> {
    /// Builds the device around `'static` hardware-shared memory. Nothing touches
    /// the bus until [`Usb::attach`].
    pub fn new(
        sie: S,
        table: &'static BdTable,
        packets: &'static mut PacketStorage,
        irq: I,
        clock: C,
        device: B,
        config: &Config,
    ) -> Result<Self, Error> {
        config.validate()?;
        let scsi = Scsi::new(device, config)?;
        let bus = Endpoints::new(sie, table, packets)?;
        log::info!(
            "usb-msc {:04x}:{:04x}, {} blocks of {} bytes",
            config.vendor_id,
            config.product_id,
            scsi.device().blocks(),
            B::BLOCK_BYTES
        );
        Ok(Usb {
            bus,
            control: ControlPipe::new(Descriptors::new(config)),
            iface: BulkOnlyIface::new(scsi),
            status: DeviceStatus::new(config.self_powered),
            irq,
            clock,
            irq_priority: config.irq_priority,
            last_sof: None,
        })
    }

    /// Powers the SIE up and signals attachment with the D+ pull-up. The host
    /// answers with a bus reset.
    pub fn attach(&mut self) {
        self.clock.gate_usb(true);
        let sie = &self.bus.sie;
        let base = self.bus.bdt.base_addr();
        sie.write(Reg::BdtPage1, (base >> 8) as u8 & 0xFE);
        sie.write(Reg::BdtPage2, (base >> 16) as u8);
        sie.write(Reg::BdtPage3, (base >> 24) as u8);

        sie.write(Reg::Istat, 0xFF);
        sie.write(Reg::Errstat, 0xFF);

        let mut ctl = Ctl(0);
        ctl.set_usbensofen(true);
        sie.write(Reg::Ctl, ctl.0);
        // transceiver out of suspend, weak pull-downs off
        sie.write(Reg::UsbCtrl, 0);
        sie.write(Reg::Inten, Istat::USBRST);

        self.irq.set_priority(self.irq_priority);
        self.irq.enable();
        self.status.state = DeviceState::Powered;

        // pull-up last: the host starts enumerating as soon as it sees it
        self.bus.sie.write(Reg::Control, CONTROL_DPPULLUPNONOTG);
        log::info!("attached");
    }

    pub fn detach(&mut self) {
        self.bus.sie.write(Reg::Control, 0);
        self.irq.disable();
        self.bus.disable_all();
        self.control.reset();
        self.iface.reset(&mut self.bus);
        self.status.state = DeviceState::Detached;
        self.status.suspended = false;
        self.last_sof = None;
        log::info!("detached");
    }

    /// USB interrupt handler.
    pub fn isr(&mut self) {
        let istat = self.bus.sie.read(Reg::Istat);
        let mut pending = istat;
        while pending != 0 {
            let flag = 1u8 << pending.trailing_zeros();
            match flag {
                Istat::USBRST => self.bus_reset(),
                Istat::ERROR => self.error(),
                Istat::SOFTOK => self.sof(),
                Istat::TOKDNE => self.token_done(),
                Istat::SLEEP => self.sleep(),
                Istat::RESUME => self.resume(),
                Istat::STALL => self.stall(),
                _ => trace_usb!("attach interrupt ignored in device mode"),
            }
            self.bus.sie.write(Reg::Istat, flag);
            pending &= pending - 1;
        }
        // Another token may already sit in the STAT FIFO and re-raise TOKDNE.
        self.bus.sie.write(Reg::Istat, !Istat::TOKDNE);
    }

    /// Main loop work: control requests first, then the Bulk-Only interface.
    pub fn process(&mut self) {
        self.irq.disable();
        if let Some(action) = self.control.process(&mut self.bus, &mut self.status) {
            log::debug!("interface {:?}", action);
            match action {
                InterfaceAction::Enable => self.iface.enable(&mut self.bus),
                InterfaceAction::Disable => self.iface.disable(&mut self.bus),
                InterfaceAction::Reconfigure => self.iface.reconfigure(&mut self.bus),
                InterfaceAction::Reset => self.iface.reset(&mut self.bus),
            }
        }
        if self.status.state == DeviceState::Configured {
            self.iface.process(&mut self.bus, &self.clock);
        }
        // the line stays masked until attach() when the device is off the bus
        if !matches!(self.status.state, DeviceState::Detached | DeviceState::Attached) {
            self.irq.enable();
        }
    }

    pub fn state(&self) -> DeviceState { self.status.state }

    pub fn suspended(&self) -> bool { self.status.suspended }

    pub fn status(&self) -> &DeviceStatus { &self.status }

    /// True while SOFs keep arriving.
    pub fn active(&self) -> bool {
        match self.last_sof {
            Some(at) => self.clock.millis().wrapping_sub(at) <= ACTIVITY_WINDOW_MS,
            None => false,
        }
    }

    pub fn interface(&self) -> &BulkOnlyIface<B> { &self.iface }

    pub fn device(&self) -> &B { self.iface.scsi().device() }

    pub fn device_mut(&mut self) -> &mut B { self.iface.scsi_mut().device_mut() }

    #[cfg(test)]
    pub(crate) fn bus_mut(&mut self) -> &mut Endpoints<S> { &mut self.bus }

    fn bus_reset(&mut self) {
        log::info!("bus reset");
        self.bus.sie.modify(Reg::Ctl, |v| {
            let mut ctl = Ctl(v);
            ctl.set_oddrst(true);
            ctl.0
        });
        self.bus.bus_reset();
        self.bus.sie.modify(Reg::Ctl, |v| {
            let mut ctl = Ctl(v);
            ctl.set_oddrst(false);
            ctl.0
        });
        self.control.reset();
        self.iface.reset(&mut self.bus);

        let sie = &self.bus.sie;
        sie.write(Reg::Errstat, 0xFF);
        sie.write(Reg::Istat, 0xFF);
        sie.write(Reg::Erren, ErrStat::ALL);
        sie.write(Reg::Inten, INTEN_RUNNING);
        sie.write(Reg::Addr, 0);

        self.status.suspended = false;
        self.status.remote_wakeup = false;
        self.status.state = DeviceState::Default;
    }

    fn error(&mut self) {
        let err = ErrStat(self.bus.sie.read(Reg::Errstat));
        for flag in err.flags() {
            log::warn!("usb error: {}", flag);
        }
        self.bus.sie.write(Reg::Errstat, 0xFF);
    }

    fn sof(&mut self) {
        self.last_sof = Some(self.clock.millis());
        self.status.suspended = false;
    }

    fn token_done(&mut self) {
        let stat = Stat(self.bus.sie.read(Reg::Stat));
        if let Some(address) = self.bus.token_done(stat) {
            self.set_address(address);
        }
    }

    /// Applies a Set Address whose Status stage just completed.
    fn set_address(&mut self, address: u8) {
        match self.status.state {
            DeviceState::Default if address != 0 => self.status.state = DeviceState::Address,
            DeviceState::Address if address == 0 => self.status.state = DeviceState::Default,
            DeviceState::Address => {}
            _ => return,
        }
        self.bus.sie.write(Reg::Addr, address);
        log::info!("address {} ({:?})", address, self.status.state);
    }

    fn sleep(&mut self) {
        trace_usb!("suspend");
        self.status.suspended = true;
        self.bus.sie.modify(Reg::Inten, |v| v | Istat::RESUME);
    }

    fn resume(&mut self) {
        trace_usb!("resume");
        self.status.suspended = false;
        self.bus.sie.modify(Reg::Inten, |v| v & !Istat::RESUME);
    }

    fn stall(&mut self) {
        if self.bus.ep0.stalled() {
            self.bus.ep0_unstall();
        }
    }
}
