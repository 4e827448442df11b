use core::fmt;

/// Errors raised while constructing or attaching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A configuration field is out of range. The payload names the field.
    InvalidConfig(&'static str),
    /// The block device cannot be served with the fixed block buffer.
    BlockSize(usize),
    /// The packet pool could not supply the control endpoint's reserved packets.
    PoolExhausted,
    BlockDevice(BlockDeviceError),
}

impl From<BlockDeviceError> for Error {
    fn from(e: BlockDeviceError) -> Error { Error::BlockDevice(e) }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(field) => write!(f, "invalid configuration: {}", field),
            Error::BlockSize(bytes) => write!(f, "unsupported block size {}", bytes),
            Error::PoolExhausted => f.write_str("packet pool exhausted"),
            Error::BlockDevice(e) => write!(f, "block device: {:?}", e),
        }
    }
}

/// Failure reported by a [`crate::BlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceError {
    /// The device is busy; the operation may succeed if retried.
    Busy,
    InvalidArgument,
    /// The stream handle does not refer to an open stream.
    BadDescriptor,
    Io,
    TimedOut,
    /// The block address is outside the medium.
    InvalidAddress,
}

/// Why a control request was refused. Every variant ends in a Request Error
/// (endpoint 0 stalls); the reason only feeds the debug log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// bmRequestType type is Vendor or Reserved, or the recipient is Other.
    Unsupported,
    UnknownRequest(u8),
    WrongDirection,
    WrongRecipient,
    /// The request is not allowed in the current device state.
    WrongState,
    /// wValue, wIndex or wLength carry a value the request does not accept.
    InvalidField,
    UnknownEndpoint,
    UnknownDescriptor,
}

/// Outcome of a SCSI operation that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiError {
    /// The command failed and sense data has been latched (CSW status Failed).
    Failed,
    /// The command or transfer does not fit the transport (CSW status Phase Error).
    Structural,
}
