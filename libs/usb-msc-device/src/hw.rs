//! Register-level access to the Kinetis USB-OTG serial interface engine and the
//! two platform services the stack needs from outside: the USB interrupt line and
//! a millisecond clock with USB clock gating.
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use bitfield::bitfield;

/// Physical base of the USB0 block.
pub const USB0_BASE: usize = 0x4007_2000;

/// SIE registers. Every register is 8 bits wide on a 32-bit stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Istat,
    Inten,
    Errstat,
    Erren,
    Stat,
    Ctl,
    Addr,
    BdtPage1,
    BdtPage2,
    BdtPage3,
    Endpt(u8),
    UsbCtrl,
    Control,
}

impl Reg {
    pub const fn offset(self) -> usize {
        match self {
            Reg::Istat => 0x80,
            Reg::Inten => 0x84,
            Reg::Errstat => 0x88,
            Reg::Erren => 0x8C,
            Reg::Stat => 0x90,
            Reg::Ctl => 0x94,
            Reg::Addr => 0x98,
            Reg::BdtPage1 => 0x9C,
            Reg::BdtPage2 => 0xB0,
            Reg::BdtPage3 => 0xB4,
            Reg::Endpt(n) => 0xC0 + 4 * (n as usize & 0xF),
            Reg::UsbCtrl => 0x100,
            Reg::Control => 0x108,
        }
    }
}

/// Byte-wide access to the SIE register file.
///
/// ISTAT and ERRSTAT are write-one-to-clear, so never `modify()` them.
pub trait Sie {
    fn read(&self, reg: Reg) -> u8;
    fn write(&self, reg: Reg, value: u8);
    fn modify<F: FnOnce(u8) -> u8>(&self, reg: Reg, f: F) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }
}

impl<T: Sie + ?Sized> Sie for &T {
    fn read(&self, reg: Reg) -> u8 { (**self).read(reg) }

    fn write(&self, reg: Reg, value: u8) { (**self).write(reg, value) }
}

/// Memory-mapped SIE.
pub struct KinetisSie {
    base: AtomicPtr<u8>,
}

impl KinetisSie {
    /// # Safety
    ///
    /// `base` must point at the USB0 register block (see [`USB0_BASE`]) and no other
    /// code may drive that block while this handle exists.
    pub unsafe fn new(base: *mut u8) -> KinetisSie { KinetisSie { base: AtomicPtr::new(base) } }
}

impl Sie for KinetisSie {
    fn read(&self, reg: Reg) -> u8 {
        unsafe { self.base.load(Ordering::SeqCst).add(reg.offset()).read_volatile() }
    }

    fn write(&self, reg: Reg, value: u8) {
        unsafe { self.base.load(Ordering::SeqCst).add(reg.offset()).write_volatile(value) }
    }
}

impl fmt::Debug for KinetisSie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KinetisSie@{:p}: ", self.base.load(Ordering::SeqCst))?;
        write!(f, "{:?} {:?}", Istat(self.read(Reg::Istat)), Ctl(self.read(Reg::Ctl)))
    }
}

/// Enable/priority control for the single USB interrupt line.
pub trait InterruptLine {
    fn enable(&mut self);
    fn disable(&mut self);
    fn set_priority(&mut self, priority: u8);
}

/// Clock services: module clock gating for the SIE and a free-running ms counter.
pub trait SystemClock {
    fn gate_usb(&mut self, on: bool);
    /// Wrapping millisecond counter.
    fn millis(&self) -> u32;
}

bitfield! {
    /// ISTAT, also the layout of INTEN.
    pub struct Istat(u8);
    pub usbrst, set_usbrst: 0;
    pub error, set_error: 1;
    pub softok, set_softok: 2;
    pub tokdne, set_tokdne: 3;
    pub sleep, set_sleep: 4;
    pub resume, set_resume: 5;
    pub attach, set_attach: 6;
    pub stall, set_stall: 7;
}
impl Istat {
    pub const USBRST: u8 = 1 << 0;
    pub const ERROR: u8 = 1 << 1;
    pub const SOFTOK: u8 = 1 << 2;
    pub const TOKDNE: u8 = 1 << 3;
    pub const SLEEP: u8 = 1 << 4;
    pub const RESUME: u8 = 1 << 5;
    pub const ATTACH: u8 = 1 << 6;
    pub const STALL: u8 = 1 << 7;
}
impl fmt::Debug for Istat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Istat: ")?;
        if self.0 == 0 {
            return f.write_str("NIL");
        }
        let names = ["usbrst ", "error ", "softok ", "tokdne ", "sleep ", "resume ", "attach ", "stall "];
        for (bit, name) in names.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

bitfield! {
    /// ERRSTAT, also the layout of ERREN.
    pub struct ErrStat(u8);
    pub piderr, _: 0;
    pub crc5eof, _: 1;
    pub crc16, _: 2;
    pub dfn8, _: 3;
    pub btoerr, _: 4;
    pub dmaerr, _: 5;
    pub btserr, _: 7;
}
impl ErrStat {
    pub const ALL: u8 = 0xBF;

    /// Names of the flags that are set, lowest bit first.
    pub fn flags(&self) -> impl Iterator<Item = &'static str> + '_ {
        static NAMES: [(u8, &str); 7] = [
            (0, "PID check failure"),
            (1, "CRC5 or EOF error"),
            (2, "CRC16 error"),
            (3, "data field not 8 bits"),
            (4, "bus turnaround timeout"),
            (5, "DMA error"),
            (7, "bit stuff error"),
        ];
        NAMES.iter().filter(move |(bit, _)| self.0 & (1 << bit) != 0).map(|(_, name)| *name)
    }
}
impl fmt::Debug for ErrStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrStat: ")?;
        for name in self.flags() {
            write!(f, "{}; ", name)?;
        }
        Ok(())
    }
}

bitfield! {
    /// STAT: the token that just completed.
    pub struct Stat(u8);
    impl Debug;
    pub odd, _: 2;
    pub tx, _: 3;
    pub u8, endp, _: 7, 4;
}

bitfield! {
    pub struct Ctl(u8);
    impl Debug;
    pub usbensofen, set_usbensofen: 0;
    pub oddrst, set_oddrst: 1;
    pub resume, set_resume: 2;
    pub txsuspendtokenbusy, set_txsuspendtokenbusy: 5;
}

bitfield! {
    pub struct Endpt(u8);
    impl Debug;
    pub ephshk, set_ephshk: 0;
    pub epstall, set_epstall: 1;
    pub eptxen, set_eptxen: 2;
    pub eprxen, set_eprxen: 3;
}

/// CONTROL register: D+ pull-up for non-OTG device mode.
pub const CONTROL_DPPULLUPNONOTG: u8 = 1 << 4;
