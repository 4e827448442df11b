use crate::error::Error;

/// Longest string descriptor payload, in characters. bLength is a single byte.
pub const MAX_STRING_CHARS: usize = 126;
/// Longest serial number, in hex digits.
pub const MAX_SERIAL_CHARS: usize = 16;

/// Device identity and tuning knobs.
///
/// The defaults reproduce the stock firmware identity. `validate()` is called by
/// [`crate::Usb::new`], so a bad configuration never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_release: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    /// Must be 12 to 16 hex digits, as required of mass-storage serial numbers.
    pub serial: &'static str,
    /// Reported both in the configuration descriptor and by Get Status.
    pub self_powered: bool,
    /// Bus current draw in mA, rounded down to 2 mA units on the wire.
    pub max_power_ma: u16,
    /// Standard Inquiry T10 vendor identification, at most 8 characters.
    pub inquiry_vendor: &'static str,
    /// Standard Inquiry product identification, at most 16 characters.
    pub inquiry_product: &'static str,
    /// Standard Inquiry product revision, at most 4 characters.
    pub inquiry_revision: &'static str,
    /// Attempts per block read before a medium error is latched.
    pub read_retries: u8,
    /// Attempts per block write before a medium error is latched.
    pub write_retries: u8,
    /// Upper bound in ms spent retrying one block; 0 disables the bound.
    pub recovery_time_ms: u32,
    pub irq_priority: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vendor_id: 0x16C0,
            product_id: 0x0001,
            device_release: 0x0100,
            manufacturer: "KTW",
            product: "Boogie Box",
            serial: "0000000000000001",
            self_powered: false,
            max_power_ma: 100,
            inquiry_vendor: "KTW",
            inquiry_product: "Boogie Box",
            inquiry_revision: "1.1",
            read_retries: 10,
            write_retries: 10,
            recovery_time_ms: 0,
            irq_priority: 112,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        fn printable(s: &str, max: usize) -> bool {
            s.len() <= max && s.bytes().all(|b| (0x20..0x7F).contains(&b))
        }
        if !printable(self.manufacturer, MAX_STRING_CHARS) {
            return Err(Error::InvalidConfig("manufacturer"));
        }
        if !printable(self.product, MAX_STRING_CHARS) {
            return Err(Error::InvalidConfig("product"));
        }
        if self.serial.len() < 12
            || self.serial.len() > MAX_SERIAL_CHARS
            || !self.serial.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::InvalidConfig("serial"));
        }
        if self.max_power_ma > 500 {
            return Err(Error::InvalidConfig("max_power_ma"));
        }
        if !printable(self.inquiry_vendor, 8) {
            return Err(Error::InvalidConfig("inquiry_vendor"));
        }
        if !printable(self.inquiry_product, 16) {
            return Err(Error::InvalidConfig("inquiry_product"));
        }
        if !printable(self.inquiry_revision, 4) {
            return Err(Error::InvalidConfig("inquiry_revision"));
        }
        if self.read_retries == 0 || self.write_retries == 0 {
            return Err(Error::InvalidConfig("retries"));
        }
        Ok(())
    }
}
