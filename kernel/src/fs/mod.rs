//! Filesystem layer
//!
//! Block devices come from the driver layer; everything above them is
//! here: the shared buffer cache, the ext2 implementation, and the
//! per-task descriptor tables. The syscall layer talks to the mounted
//! root volume through [`root`].

use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Once;

pub mod bcache;
pub mod blockdev;
pub mod ext2;
pub mod file;

pub use bcache::{BufferCache, CacheStats, BCACHE_SIZE};
pub use blockdev::{BlockDev, BlockDevice, RamDisk, SECTOR_SIZE};
pub use ext2::{DirEntryInfo, Ext2Fs, Stat, ROOT_INO};
pub use file::{FdTable, OpenFlags};

use crate::error::{KernelError, KernelResult};

lazy_static! {
    /// The system-wide buffer cache, shared by every mounted volume.
    pub static ref BCACHE: Arc<BufferCache> = Arc::new(BufferCache::new());
}

/// The mounted root volume.
static ROOT_FS: Once<Arc<Ext2Fs>> = Once::new();

/// Mount `dev` as the root filesystem.
pub fn mount_root(dev: BlockDev) -> KernelResult<()> {
    let fs = Ext2Fs::mount(dev, BCACHE.clone())?;
    ROOT_FS.call_once(|| Arc::new(fs));
    Ok(())
}

/// The root volume, once mounted.
pub fn root() -> KernelResult<Arc<Ext2Fs>> {
    ROOT_FS.get().cloned().ok_or(KernelError::NotFound)
}

/// Flush the root volume's metadata and every dirty buffer.
pub fn sync() -> KernelResult<()> {
    root()?.sync()
}
