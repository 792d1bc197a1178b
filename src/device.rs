use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::consts::{BlockNo, BLOCK_SIZE};
use crate::util::error::{FsError, FsResult};

/// Fixed-size block read/write over an underlying byte-addressable store.
pub trait BlockDevice {
    fn block_count(&self) -> u32;
    fn read_block(&self, index: BlockNo, buffer: &mut [u8]) -> FsResult<()>;
    fn write_block(&mut self, index: BlockNo, buffer: &[u8]) -> FsResult<()>;

    fn write_zero_blocks(&mut self, start: BlockNo, count: u32) -> FsResult<()> {
        let zeroes = [0u8; BLOCK_SIZE];
        for i in 0..count {
            self.write_block(start + i, &zeroes)?;
        }
        Ok(())
    }
}

/// A device backed by a regular file or a raw block device node.
pub struct FileDevice {
    file: File,
    block_count: u32,
}

impl FileDevice {
    /// Open an existing image or device read/write.
    pub fn open(path: &Path) -> FsResult<FileDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        FileDevice::from_file(file)
    }

    pub fn open_read_only(path: &Path) -> FsResult<FileDevice> {
        let file = OpenOptions::new().read(true).open(path)?;
        FileDevice::from_file(file)
    }

    /// Create a fresh image file of `block_count` blocks. Fails if the file
    /// already exists.
    pub fn create(path: &Path, block_count: u32) -> FsResult<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(block_count as u64 * BLOCK_SIZE as u64)?;
        Ok(FileDevice { file, block_count })
    }

    pub fn from_file(file: File) -> FsResult<FileDevice> {
        let bytes = device_size(&file)?;
        let block_count = (bytes / BLOCK_SIZE as u64) as u32;
        Ok(FileDevice { file, block_count })
    }

    /// Resize a regular file to hold exactly `block_count` blocks.
    pub fn set_block_count(&mut self, block_count: u32) -> FsResult<()> {
        self.file
            .set_len(block_count as u64 * BLOCK_SIZE as u64)?;
        self.block_count = block_count;
        Ok(())
    }

    pub fn is_block_device(&self) -> bool {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let result = unsafe { libc::fstat(self.file.as_raw_fd(), stat.as_mut_ptr()) };
        if result != 0 {
            return false;
        }
        let stat = unsafe { stat.assume_init() };
        (stat.st_mode & libc::S_IFMT) == libc::S_IFBLK
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, index: BlockNo, buffer: &mut [u8]) -> FsResult<()> {
        if buffer.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument);
        }
        if index >= self.block_count {
            return Err(FsError::Io);
        }
        self.file
            .read_exact_at(buffer, index as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn write_block(&mut self, index: BlockNo, buffer: &[u8]) -> FsResult<()> {
        if buffer.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument);
        }
        if index >= self.block_count {
            return Err(FsError::Io);
        }
        self.file
            .write_all_at(buffer, index as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }
}

/// Size in bytes: probed via ioctl for block devices, fstat otherwise.
fn device_size(file: &File) -> FsResult<u64> {
    let fd = file.as_raw_fd();
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(FsError::Io);
    }
    let stat = unsafe { stat.assume_init() };
    if (stat.st_mode & libc::S_IFMT) == libc::S_IFBLK {
        // Not exposed by the libc crate; matches <linux/fs.h> _IOR(0x12, 114, size_t).
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;
        let mut bytes: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut bytes) };
        if result != 0 {
            return Err(FsError::Io);
        }
        Ok(bytes)
    } else {
        Ok(stat.st_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_device(blocks: u32) -> FileDevice {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        FileDevice::from_file(file).unwrap()
    }

    #[test]
    fn read_write_roundtrip() {
        let mut device = scratch_device(16);
        assert_eq!(device.block_count(), 16);

        let block = [0x42u8; BLOCK_SIZE];
        device.write_block(3, &block).unwrap();

        let mut read = [0u8; BLOCK_SIZE];
        device.read_block(3, &mut read).unwrap();
        assert_eq!(read, block);

        device.read_block(4, &mut read).unwrap();
        assert_eq!(read, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut device = scratch_device(8);
        let block = [0u8; BLOCK_SIZE];
        assert_eq!(device.write_block(8, &block), Err(FsError::Io));

        let mut read = [0u8; BLOCK_SIZE];
        assert_eq!(device.read_block(9, &mut read), Err(FsError::Io));
    }

    #[test]
    fn zero_fill() {
        let mut device = scratch_device(8);
        let block = [0xFFu8; BLOCK_SIZE];
        device.write_block(2, &block).unwrap();
        device.write_block(3, &block).unwrap();
        device.write_zero_blocks(2, 2).unwrap();

        let mut read = [0u8; BLOCK_SIZE];
        device.read_block(2, &mut read).unwrap();
        assert_eq!(read, [0u8; BLOCK_SIZE]);
        device.read_block(3, &mut read).unwrap();
        assert_eq!(read, [0u8; BLOCK_SIZE]);
    }
}
