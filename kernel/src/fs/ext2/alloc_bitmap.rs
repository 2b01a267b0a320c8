//! Block and inode allocation
//!
//! First-zero-bit scans over the per-group bitmaps, in group order.
//! Fairness across groups is not attempted. Counter updates hit the
//! superblock and group descriptor immediately through the cache.

use alloc::vec;

use super::Ext2Fs;
use crate::error::{KernelError, KernelResult};

/// First clear bit in `bitmap`, bounded by `max_bits`.
fn find_zero_bit(bitmap: &[u8], max_bits: u32) -> Option<u32> {
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        if *byte == 0xFF {
            continue;
        }
        for bit in 0..8 {
            let index = byte_idx as u32 * 8 + bit;
            if index >= max_bits {
                return None;
            }
            if *byte & (1 << bit) == 0 {
                return Some(index);
            }
        }
    }
    None
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

/// Clear a bit, reporting whether it was set.
fn clear_bit(bitmap: &mut [u8], bit: u32) -> bool {
    let byte = &mut bitmap[(bit / 8) as usize];
    let mask = 1 << (bit % 8);
    let was_set = *byte & mask != 0;
    *byte &= !mask;
    was_set
}

impl Ext2Fs {
    /// Allocate one data block: scan group bitmaps in order, flip the
    /// first zero bit, update the counters, and return the zeroed block.
    pub fn alloc_block(&self) -> KernelResult<u32> {
        let (first_data, blocks_per_group, blocks_count) = {
            let sb = self.sb.read();
            (sb.first_data_block, sb.blocks_per_group, sb.blocks_count)
        };

        let group_count = self.groups.read().len();
        for g in 0..group_count {
            let desc = self.groups.read()[g];
            if desc.free_blocks_count == 0 {
                continue;
            }
            let in_group =
                (blocks_count - first_data) .min(blocks_per_group * (g as u32 + 1)) - blocks_per_group * g as u32;
            let found = self.modify_block(desc.block_bitmap, |bm| {
                let bit = find_zero_bit(bm, in_group)?;
                set_bit(bm, bit);
                Some(bit)
            })?;
            if let Some(bit) = found {
                self.groups.write()[g].free_blocks_count -= 1;
                self.sb.write().free_blocks_count -= 1;
                self.write_group_desc(g)?;
                self.write_superblock()?;

                let block = first_data + blocks_per_group * g as u32 + bit;
                self.write_block(block, &vec![0u8; self.block_size])?;
                return Ok(block);
            }
        }
        Err(KernelError::OutOfBlocks)
    }

    /// Return a data block to its group.
    pub(crate) fn free_block_num(&self, block: u32) -> KernelResult<()> {
        let (first_data, blocks_per_group) = {
            let sb = self.sb.read();
            (sb.first_data_block, sb.blocks_per_group)
        };
        if block < first_data {
            return Err(KernelError::Invalid);
        }
        let rel = block - first_data;
        let g = (rel / blocks_per_group) as usize;
        let bit = rel % blocks_per_group;
        let desc = *self
            .groups
            .read()
            .get(g)
            .ok_or(KernelError::Invalid)?;

        let was_set = self.modify_block(desc.block_bitmap, |bm| clear_bit(bm, bit))?;
        if !was_set {
            log::warn!("[EXT2] double free of block {}", block);
            return Ok(());
        }
        self.groups.write()[g].free_blocks_count += 1;
        self.sb.write().free_blocks_count += 1;
        self.write_group_desc(g)?;
        self.write_superblock()
    }

    /// Allocate an inode; directories also bump the group's directory
    /// count. Returns the 1-based inode number.
    pub fn alloc_inode(&self, is_dir: bool) -> KernelResult<u32> {
        let inodes_per_group = self.sb.read().inodes_per_group;

        let group_count = self.groups.read().len();
        for g in 0..group_count {
            let desc = self.groups.read()[g];
            if desc.free_inodes_count == 0 {
                continue;
            }
            let found = self.modify_block(desc.inode_bitmap, |bm| {
                let bit = find_zero_bit(bm, inodes_per_group)?;
                set_bit(bm, bit);
                Some(bit)
            })?;
            if let Some(bit) = found {
                {
                    let mut groups = self.groups.write();
                    groups[g].free_inodes_count -= 1;
                    if is_dir {
                        groups[g].used_dirs_count += 1;
                    }
                }
                self.sb.write().free_inodes_count -= 1;
                self.write_group_desc(g)?;
                self.write_superblock()?;
                return Ok(inodes_per_group * g as u32 + bit + 1);
            }
        }
        Err(KernelError::OutOfInodes)
    }

    /// Release an inode number.
    pub(crate) fn free_inode_num(&self, ino: u32, is_dir: bool) -> KernelResult<()> {
        let inodes_per_group = self.sb.read().inodes_per_group;
        if ino == 0 {
            return Err(KernelError::Invalid);
        }
        let g = ((ino - 1) / inodes_per_group) as usize;
        let bit = (ino - 1) % inodes_per_group;
        let desc = *self
            .groups
            .read()
            .get(g)
            .ok_or(KernelError::Invalid)?;

        let was_set = self.modify_block(desc.inode_bitmap, |bm| clear_bit(bm, bit))?;
        if !was_set {
            log::warn!("[EXT2] double free of inode {}", ino);
            return Ok(());
        }
        {
            let mut groups = self.groups.write();
            groups[g].free_inodes_count += 1;
            if is_dir {
                groups[g].used_dirs_count -= 1;
            }
        }
        self.sb.write().free_inodes_count += 1;
        self.write_group_desc(g)?;
        self.write_superblock()
    }
}
