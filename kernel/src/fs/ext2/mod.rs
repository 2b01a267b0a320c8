//! Ext2 filesystem
//!
//! Bit-exact ext2 layered over the buffer cache: superblock at byte 1024,
//! block groups with block/inode bitmaps and an inode table, 12 direct
//! plus three levels of indirect pointers, and variable-length directory
//! records. Volumes produced by a standard `mke2fs` with default options
//! mount; the in-tree formatter builds the minimal single-group volume
//! used by the ramdisk and the tests.
//!
//! Every metadata change goes through the cache and marks the touched
//! sectors dirty immediately; `sync` rewrites the superblock and group
//! descriptors and then flushes the whole cache.

mod alloc_bitmap;
mod dir;
mod inode;
mod ops;

pub use dir::DirEntryInfo;
pub use inode::Stat;

use alloc::{sync::Arc, vec, vec::Vec};
use core::mem::size_of;

use spin::RwLock;

use super::{
    bcache::BufferCache,
    blockdev::{BlockDev, SECTOR_SIZE},
};
use crate::error::{KernelError, KernelResult};

/// Ext2 magic value at superblock offset 56
pub const EXT2_MAGIC: u16 = 0xEF53;

/// LBA of the superblock (byte 1024 on 512-byte sectors)
const SUPERBLOCK_LBA: u64 = 2;

/// Root directory inode
pub const ROOT_INO: u32 = 2;

/// First non-reserved inode (rev 1 default)
const FIRST_INO: u32 = 11;

/// Number of direct block pointers in an inode
pub const DIRECT_BLOCKS: usize = 12;

/// File mode type bits
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;
const S_IFMT: u16 = 0xF000;

/// Directory entry `file_type` values
pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;

/// On-disk superblock (leading fields; the rest of the 1024-byte area is
/// preserved untouched).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: i32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_inode: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

/// On-disk block group descriptor (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub pad: u16,
    pub reserved: [u32; 3],
}

/// On-disk inode (128-byte base layout)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Allocated storage in 512-byte sectors, indirect blocks included
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    /// 12 direct pointers, then single, double, triple indirect
    pub block: [u32; 15],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl DiskInode {
    pub fn zeroed() -> Self {
        // SAFETY: DiskInode is plain-old-data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    pub fn new(mode: u16) -> Self {
        Self {
            mode,
            links_count: 1,
            ..Self::zeroed()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Read a POD struct from the head of a byte slice (little-endian disk
/// layout matches the target).
pub(crate) fn read_struct<T: Copy>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= size_of::<T>());
    // SAFETY: length checked; T is a plain-old-data on-disk struct and
    // `read_unaligned` has no alignment requirement.
    unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

/// Write a POD struct to the head of a byte slice.
pub(crate) fn write_struct<T: Copy>(value: &T, bytes: &mut [u8]) {
    assert!(bytes.len() >= size_of::<T>());
    // SAFETY: length checked; distinct allocations cannot overlap.
    unsafe {
        core::ptr::copy_nonoverlapping(
            value as *const T as *const u8,
            bytes.as_mut_ptr(),
            size_of::<T>(),
        );
    }
}

/// A mounted ext2 volume.
pub struct Ext2Fs {
    dev: BlockDev,
    cache: Arc<BufferCache>,
    pub(crate) sb: RwLock<Superblock>,
    pub(crate) groups: RwLock<Vec<GroupDesc>>,
    /// Derived constants, fixed at mount
    pub(crate) block_size: usize,
    pub(crate) sectors_per_block: u64,
    pub(crate) inode_size: usize,
    pub(crate) ptrs_per_block: usize,
    first_data_block: u32,
    group_desc_block: u32,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl Ext2Fs {
    /// Mount a volume: validate the superblock, derive the geometry, and
    /// load the group descriptors.
    pub fn mount(dev: BlockDev, cache: Arc<BufferCache>) -> KernelResult<Self> {
        let mut raw = [0u8; SECTOR_SIZE];
        {
            let buf = cache.get(&dev, SUPERBLOCK_LBA)?;
            buf.copy_out(0, &mut raw);
        }
        let sb: Superblock = read_struct(&raw);
        if sb.magic != EXT2_MAGIC {
            return Err(KernelError::Invalid);
        }

        let block_size = 1024usize
            .checked_shl(sb.log_block_size)
            .ok_or(KernelError::Invalid)?;
        if !(1024..=4096).contains(&block_size) {
            return Err(KernelError::Invalid);
        }
        let inode_size = if sb.rev_level >= 1 {
            sb.inode_size as usize
        } else {
            128
        };
        if inode_size < 128 || inode_size > block_size {
            return Err(KernelError::Invalid);
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(KernelError::Invalid);
        }

        let first_data_block = sb.first_data_block;
        let fs = Self {
            dev,
            cache,
            sb: RwLock::new(sb),
            groups: RwLock::new(Vec::new()),
            block_size,
            sectors_per_block: (block_size / SECTOR_SIZE) as u64,
            inode_size,
            ptrs_per_block: block_size / 4,
            first_data_block,
            group_desc_block: first_data_block + 1,
        };

        let group_count = (sb.blocks_count - first_data_block).div_ceil(sb.blocks_per_group);
        let mut groups = Vec::with_capacity(group_count as usize);
        let per_block = fs.block_size / size_of::<GroupDesc>();
        for g in 0..group_count as usize {
            let block = fs.group_desc_block + (g / per_block) as u32;
            let data = fs.read_block(block)?;
            let off = (g % per_block) * size_of::<GroupDesc>();
            groups.push(read_struct::<GroupDesc>(&data[off..]));
        }
        *fs.groups.write() = groups;

        log::info!(
            "[EXT2] mounted {}: {} blocks of {} bytes, {} inodes, {} group(s)",
            fs.dev.name(),
            sb.blocks_count,
            block_size,
            sb.inodes_count,
            group_count
        );
        Ok(fs)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Free-space counters (superblock view).
    pub fn free_counts(&self) -> (u32, u32) {
        let sb = self.sb.read();
        (sb.free_blocks_count, sb.free_inodes_count)
    }

    pub(crate) fn block_lba(&self, block: u32) -> u64 {
        block as u64 * self.sectors_per_block
    }

    /// Read a filesystem block through the cache.
    pub(crate) fn read_block(&self, block: u32) -> KernelResult<Vec<u8>> {
        let mut out = vec![0u8; self.block_size];
        let base = self.block_lba(block);
        for s in 0..self.sectors_per_block {
            let buf = self.cache.get(&self.dev, base + s)?;
            buf.copy_out(0, &mut out[s as usize * SECTOR_SIZE..][..SECTOR_SIZE]);
        }
        Ok(out)
    }

    /// Write a filesystem block through the cache (marks sectors dirty).
    pub(crate) fn write_block(&self, block: u32, data: &[u8]) -> KernelResult<()> {
        assert_eq!(data.len(), self.block_size);
        let base = self.block_lba(block);
        for s in 0..self.sectors_per_block {
            let buf = self.cache.get(&self.dev, base + s)?;
            buf.copy_in(0, &data[s as usize * SECTOR_SIZE..][..SECTOR_SIZE]);
        }
        Ok(())
    }

    /// Read-modify-write one block.
    pub(crate) fn modify_block<R>(
        &self,
        block: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> KernelResult<R> {
        let mut data = self.read_block(block)?;
        let result = f(&mut data);
        self.write_block(block, &data)?;
        Ok(result)
    }

    /// Push the in-memory superblock to the cache.
    pub(crate) fn write_superblock(&self) -> KernelResult<()> {
        let sb = *self.sb.read();
        let buf = self.cache.get(&self.dev, SUPERBLOCK_LBA)?;
        buf.with_data_mut(|d| write_struct(&sb, d));
        Ok(())
    }

    /// Push the in-memory group descriptors to the cache.
    pub(crate) fn write_group_desc(&self, group: usize) -> KernelResult<()> {
        let desc = self.groups.read()[group];
        let per_block = self.block_size / size_of::<GroupDesc>();
        let block = self.group_desc_block + (group / per_block) as u32;
        let off = (group % per_block) * size_of::<GroupDesc>();
        self.modify_block(block, |data| write_struct(&desc, &mut data[off..]))?;
        Ok(())
    }

    /// Flush all metadata and every dirty buffer.
    pub fn sync(&self) -> KernelResult<()> {
        self.write_superblock()?;
        for g in 0..self.groups.read().len() {
            self.write_group_desc(g)?;
        }
        self.cache.sync_all()
    }

    /// Format `dev` as a minimal single-group rev-1 volume and mount it.
    ///
    /// Layout (1 KiB blocks): boot block, superblock, group descriptors,
    /// block bitmap, inode bitmap, inode table, then data, with the root
    /// directory occupying the first data block.
    pub fn format(
        dev: BlockDev,
        cache: Arc<BufferCache>,
        total_blocks: u32,
        inode_count: u32,
    ) -> KernelResult<Self> {
        const BS: usize = 1024;
        let inode_table_blocks = (inode_count as usize * 128).div_ceil(BS) as u32;
        let first_free = 5 + inode_table_blocks; // after boot/sb/gd/bitmaps/table
        let root_block = first_free;
        if total_blocks < root_block + 2
            || total_blocks > 8192
            || inode_count < FIRST_INO
            || inode_count as usize > BS * 8
            || dev.sector_count() < total_blocks as u64 * 2
        {
            return Err(KernelError::Invalid);
        }

        let sb = Superblock {
            inodes_count: inode_count,
            blocks_count: total_blocks,
            reserved_blocks_count: 0,
            free_blocks_count: total_blocks - root_block - 1,
            free_inodes_count: inode_count - (FIRST_INO - 1),
            first_data_block: 1,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: 8192,
            frags_per_group: 8192,
            inodes_per_group: inode_count,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: 0xFFFF,
            magic: EXT2_MAGIC,
            state: 1,
            errors: 1,
            minor_rev_level: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 1,
            def_resuid: 0,
            def_resgid: 0,
            first_inode: FIRST_INO,
            inode_size: 128,
            block_group_nr: 0,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
        };

        let gd = GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: sb.free_blocks_count as u16,
            free_inodes_count: sb.free_inodes_count as u16,
            used_dirs_count: 1,
            pad: 0,
            reserved: [0; 3],
        };

        let write_full = |block: u32, data: &[u8]| -> KernelResult<()> {
            for s in 0..(BS / SECTOR_SIZE) as u64 {
                let buf = cache.get(&dev, block as u64 * 2 + s)?;
                buf.copy_in(0, &data[s as usize * SECTOR_SIZE..][..SECTOR_SIZE]);
            }
            Ok(())
        };

        // Superblock block (block 1, bytes 1024..2048).
        let mut block1 = vec![0u8; BS];
        write_struct(&sb, &mut block1);
        write_full(1, &block1)?;

        // Group descriptor block.
        let mut block2 = vec![0u8; BS];
        write_struct(&gd, &mut block2);
        write_full(2, &block2)?;

        // Block bitmap: bit i covers block 1 + i. Metadata blocks and the
        // root directory block are in use; bits past the volume end are
        // forced set so the scanner never wanders off the device.
        let mut bbitmap = vec![0u8; BS];
        for block in 1..=root_block {
            let bit = block - 1;
            bbitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        for bit in (total_blocks - 1)..(BS as u32 * 8) {
            bbitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        write_full(3, &bbitmap)?;

        // Inode bitmap: reserved inodes 1..=10 in use, padding bits set.
        let mut ibitmap = vec![0u8; BS];
        for bit in 0..(FIRST_INO - 1) {
            ibitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        for bit in inode_count..(BS as u32 * 8) {
            ibitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        write_full(4, &ibitmap)?;

        // Inode table: zeroed except the root directory inode.
        let mut root = DiskInode::new(S_IFDIR | 0o755);
        root.links_count = 2; // "." and its own ".."
        root.size = BS as u32;
        root.blocks = (BS / SECTOR_SIZE) as u32;
        root.block[0] = root_block;

        for b in 0..inode_table_blocks {
            let mut table = vec![0u8; BS];
            let first_index = b as usize * (BS / 128);
            let root_index = (ROOT_INO - 1) as usize;
            if (first_index..first_index + BS / 128).contains(&root_index) {
                write_struct(&root, &mut table[(root_index - first_index) * 128..]);
            }
            write_full(5 + b, &table)?;
        }

        // Root directory block: "." then ".." spanning the rest.
        let mut rootdir = vec![0u8; BS];
        dir::write_raw_entry(&mut rootdir, 0, ROOT_INO, 12, b".", FT_DIR);
        dir::write_raw_entry(&mut rootdir, 12, ROOT_INO, (BS - 12) as u16, b"..", FT_DIR);
        write_full(root_block, &rootdir)?;

        cache.sync_all()?;
        Self::mount(dev, cache)
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    /// A freshly formatted small volume: 512 KiB, 64 inodes.
    pub(crate) fn fresh_fs() -> Ext2Fs {
        let dev: BlockDev = Arc::new(RamDisk::new("ext2-test", 1024));
        let cache = Arc::new(BufferCache::with_capacity(64));
        Ext2Fs::format(dev, cache, 512, 64).expect("format of a valid geometry succeeds")
    }
}
