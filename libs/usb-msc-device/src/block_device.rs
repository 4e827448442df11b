use crate::error::BlockDeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Read,
    Write,
}

/// Opaque handle for a streaming transfer opened with [`BlockDevice::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(pub u32);

/// Fixed block size random access storage.
///
/// Whole-block access is mandatory. A device that can move a run of blocks more
/// efficiently may also implement the streaming calls; their defaults report that
/// no stream can be opened, and all transfers then go block by block.
pub trait BlockDevice {
    /// The number of bytes per block. Bounded by the SCSI layer's block buffer.
    const BLOCK_BYTES: usize;

    /// Capacity in blocks.
    fn blocks(&self) -> u32;

    /// Read the block indicated by `lba` into `block`
    fn read_block(&mut self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Write `block` to the block indicated by `lba`
    fn write_block(&mut self, lba: u32, block: &[u8]) -> Result<(), BlockDeviceError>;

    /// Starts a transfer of `count` blocks from `lba`.
    fn open(&mut self, _lba: u32, _count: u32, _dir: StreamDirection) -> Option<StreamHandle> { None }

    /// Reads the next bytes of a stream. `Ok(0)` means nothing is ready yet.
    fn read(&mut self, _stream: StreamHandle, _buf: &mut [u8]) -> Result<usize, BlockDeviceError> {
        Err(BlockDeviceError::BadDescriptor)
    }

    /// Writes the next bytes of a stream. Returns how many were accepted; after a
    /// short count the caller finishes the transfer block by block.
    fn write(&mut self, _stream: StreamHandle, _data: &[u8]) -> Result<usize, BlockDeviceError> {
        Err(BlockDeviceError::BadDescriptor)
    }

    fn close(&mut self, _stream: StreamHandle) {}
}
