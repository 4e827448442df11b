use crate::block_device::{BlockDevice, StreamDirection, StreamHandle};
use crate::error::BlockDeviceError;

struct Stream {
    handle: StreamHandle,
    dir: StreamDirection,
    /// Byte range still to move, as absolute offsets into the backing store.
    pos: usize,
    end: usize,
}

/// Block device over a caller-provided byte slice. Handy as a scratch disk and as
/// a reference implementation of the streaming interface.
pub struct RamDisk<'a> {
    backing: &'a mut [u8],
    streaming: bool,
    stream: Option<Stream>,
    next_handle: u32,
    #[cfg(test)]
    pub(crate) fail_block_reads: u32,
    #[cfg(test)]
    pub(crate) fail_stream_after: Option<usize>,
}

impl<'a> RamDisk<'a> {
    pub const BLOCK_SIZE: usize = 512;

    /// Whole-block access only. Any trailing partial block of `backing` is unused.
    pub fn new(backing: &'a mut [u8]) -> RamDisk<'a> {
        RamDisk {
            backing,
            streaming: false,
            stream: None,
            next_handle: 1,
            #[cfg(test)]
            fail_block_reads: 0,
            #[cfg(test)]
            fail_stream_after: None,
        }
    }

    /// Also serves transfers through the streaming calls.
    pub fn with_streaming(backing: &'a mut [u8]) -> RamDisk<'a> {
        let mut disk = RamDisk::new(backing);
        disk.streaming = true;
        disk
    }

    pub fn as_slice(&self) -> &[u8] { self.backing }

    fn range(&self, lba: u32) -> Result<core::ops::Range<usize>, BlockDeviceError> {
        if lba >= self.blocks() {
            return Err(BlockDeviceError::InvalidAddress);
        }
        let start = lba as usize * Self::BLOCK_SIZE;
        Ok(start..start + Self::BLOCK_SIZE)
    }

    fn stream_mut(&mut self, handle: StreamHandle, dir: StreamDirection) -> Result<&mut Stream, BlockDeviceError> {
        match self.stream.as_mut() {
            Some(s) if s.handle == handle && s.dir == dir => Ok(s),
            _ => Err(BlockDeviceError::BadDescriptor),
        }
    }

    #[cfg(test)]
    fn stream_fault(&mut self, moved: usize) -> Result<(), BlockDeviceError> {
        match self.fail_stream_after {
            Some(budget) if moved > budget => Err(BlockDeviceError::Io),
            Some(budget) => {
                self.fail_stream_after = Some(budget - moved);
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn stream_fault(&mut self, _moved: usize) -> Result<(), BlockDeviceError> { Ok(()) }
}

impl BlockDevice for RamDisk<'_> {
    const BLOCK_BYTES: usize = RamDisk::BLOCK_SIZE;

    fn blocks(&self) -> u32 { (self.backing.len() / Self::BLOCK_BYTES) as u32 }

    fn read_block(&mut self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError> {
        #[cfg(test)]
        if self.fail_block_reads > 0 {
            self.fail_block_reads -= 1;
            return Err(BlockDeviceError::Io);
        }
        let range = self.range(lba)?;
        block[..Self::BLOCK_BYTES].copy_from_slice(&self.backing[range]);
        Ok(())
    }

    fn write_block(&mut self, lba: u32, block: &[u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(lba)?;
        self.backing[range].copy_from_slice(&block[..Self::BLOCK_BYTES]);
        Ok(())
    }

    fn open(&mut self, lba: u32, count: u32, dir: StreamDirection) -> Option<StreamHandle> {
        if !self.streaming || self.stream.is_some() {
            return None;
        }
        let end = lba.checked_add(count)?;
        if count == 0 || end > self.blocks() {
            return None;
        }
        let handle = StreamHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.stream = Some(Stream {
            handle,
            dir,
            pos: lba as usize * Self::BLOCK_BYTES,
            end: end as usize * Self::BLOCK_BYTES,
        });
        Some(handle)
    }

    fn read(&mut self, stream: StreamHandle, buf: &mut [u8]) -> Result<usize, BlockDeviceError> {
        let s = self.stream_mut(stream, StreamDirection::Read)?;
        let n = buf.len().min(s.end - s.pos);
        let start = s.pos;
        s.pos += n;
        self.stream_fault(n)?;
        buf[..n].copy_from_slice(&self.backing[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, stream: StreamHandle, data: &[u8]) -> Result<usize, BlockDeviceError> {
        let s = self.stream_mut(stream, StreamDirection::Write)?;
        let n = data.len().min(s.end - s.pos);
        let start = s.pos;
        s.pos += n;
        self.stream_fault(n)?;
        self.backing[start..start + n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self, stream: StreamHandle) {
        if self.stream.as_ref().map(|s| s.handle) == Some(stream) {
            self.stream = None;
        }
    }
}
