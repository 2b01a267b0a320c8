//! Block device abstraction
//!
//! The storage drivers live outside the core; the filesystem consumes
//! them through this trait. Sectors are 512 bytes and addressed by LBA.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use spin::RwLock;

use crate::error::{KernelError, KernelResult};

/// Sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// Block device trait (consumed from the driver layer)
pub trait BlockDevice: Send + Sync {
    /// Device name for diagnostics
    fn name(&self) -> &str;

    /// Total sectors on the device
    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `lba` into `buf`.
    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()>;
}

/// Shared handle to a block device
pub type BlockDev = Arc<dyn BlockDevice>;

/// RAM-backed block device, used by the ramdisk boot path and by tests.
pub struct RamDisk {
    name: String,
    data: RwLock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: &str, sectors: u64) -> Self {
        Self {
            name: String::from(name),
            data: RwLock::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }

    /// Build a RAM disk over an existing image (e.g. a loaded initrd).
    pub fn from_image(name: &str, image: Vec<u8>) -> KernelResult<Self> {
        if image.len() % SECTOR_SIZE != 0 {
            return Err(KernelError::Invalid);
        }
        Ok(Self {
            name: String::from(name),
            data: RwLock::new(image),
        })
    }

    fn check_range(&self, lba: u64, count: u32, len: usize) -> KernelResult<(usize, usize)> {
        let bytes = count as usize * SECTOR_SIZE;
        if len != bytes {
            return Err(KernelError::Invalid);
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + bytes;
        if end > self.data.read().len() {
            return Err(KernelError::Io);
        }
        Ok((start, end))
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_count(&self) -> u64 {
        (self.data.read().len() / SECTOR_SIZE) as u64
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
        let (start, end) = self.check_range(lba, count, buf.len())?;
        buf.copy_from_slice(&self.data.read()[start..end]);
        Ok(())
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
        let (start, end) = self.check_range(lba, count, buf.len())?;
        self.data.write()[start..end].copy_from_slice(buf);
        Ok(())
    }
}
