//! Inode access and file data mapping
//!
//! Inodes are paged through the buffer cache, never held long-term.
//! Logical block 0..11 map through the direct pointers, 12 through the
//! single-indirect block, 13 through the double-indirect chain; writes
//! into triple-indirect territory report `FileTooLarge`, reads resolve
//! it. A zero pointer anywhere is a hole; `read_data` fills holes with
//! zeros. `i_blocks` counts 512-byte sectors and includes indirect
//! blocks.

use alloc::vec::Vec;

use super::{read_struct, write_struct, DiskInode, Ext2Fs, DIRECT_BLOCKS};
use crate::error::{KernelError, KernelResult};

/// File metadata snapshot
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub ino: u32,
    pub mode: u16,
    pub links: u16,
    pub size: u64,
    /// Allocated storage in 512-byte sectors
    pub blocks: u32,
    pub is_dir: bool,
}

impl Ext2Fs {
    /// Locate an inode on disk: (block, byte offset within block).
    fn inode_location(&self, ino: u32) -> KernelResult<(u32, usize)> {
        let sb = self.sb.read();
        if ino == 0 || ino > sb.inodes_count {
            return Err(KernelError::Invalid);
        }
        let group = ((ino - 1) / sb.inodes_per_group) as usize;
        let index = ((ino - 1) % sb.inodes_per_group) as usize;
        let table = self
            .groups
            .read()
            .get(group)
            .ok_or(KernelError::Invalid)?
            .inode_table;
        let byte = index * self.inode_size;
        Ok((table + (byte / self.block_size) as u32, byte % self.block_size))
    }

    pub fn read_inode(&self, ino: u32) -> KernelResult<DiskInode> {
        let (block, offset) = self.inode_location(ino)?;
        let data = self.read_block(block)?;
        Ok(read_struct(&data[offset..]))
    }

    pub fn write_inode(&self, ino: u32, inode: &DiskInode) -> KernelResult<()> {
        let (block, offset) = self.inode_location(ino)?;
        self.modify_block(block, |data| write_struct(inode, &mut data[offset..]))
    }

    pub fn stat(&self, ino: u32) -> KernelResult<Stat> {
        let inode = self.read_inode(ino)?;
        Ok(Stat {
            ino,
            mode: inode.mode,
            links: inode.links_count,
            size: inode.size as u64,
            blocks: inode.blocks,
            is_dir: inode.is_dir(),
        })
    }

    /// Read one pointer out of an indirect block (0 when the chain has a
    /// hole at `indirect`).
    fn indirect_entry(&self, indirect: u32, index: usize) -> KernelResult<u32> {
        if indirect == 0 {
            return Ok(0);
        }
        let data = self.read_block(indirect)?;
        Ok(u32::from_le_bytes(
            data[index * 4..index * 4 + 4].try_into().expect("4 bytes"),
        ))
    }

    fn set_indirect_entry(&self, indirect: u32, index: usize, value: u32) -> KernelResult<()> {
        self.modify_block(indirect, |data| {
            data[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        })
    }

    /// Resolve a logical file block to a physical block (0 = hole).
    pub fn get_block(&self, inode: &DiskInode, logical: u32) -> KernelResult<u32> {
        let ppb = self.ptrs_per_block as u32;
        let logical = logical as u64;
        let ppb64 = ppb as u64;

        if logical < DIRECT_BLOCKS as u64 {
            return Ok(inode.block[logical as usize]);
        }
        let single_base = DIRECT_BLOCKS as u64;
        if logical < single_base + ppb64 {
            let idx = (logical - single_base) as usize;
            return self.indirect_entry(inode.block[12], idx);
        }
        let double_base = single_base + ppb64;
        if logical < double_base + ppb64 * ppb64 {
            let rel = logical - double_base;
            let l1 = self.indirect_entry(inode.block[13], (rel / ppb64) as usize)?;
            return self.indirect_entry(l1, (rel % ppb64) as usize);
        }
        let triple_base = double_base + ppb64 * ppb64;
        if logical < triple_base + ppb64 * ppb64 * ppb64 {
            let rel = logical - triple_base;
            let l1 = self.indirect_entry(inode.block[14], (rel / (ppb64 * ppb64)) as usize)?;
            let l2 = self.indirect_entry(l1, ((rel / ppb64) % ppb64) as usize)?;
            return self.indirect_entry(l2, (rel % ppb64) as usize);
        }
        Err(KernelError::Invalid)
    }

    /// Allocate an indirect block for `slot` if it is a hole, charging
    /// the inode for the new block.
    fn ensure_slot(&self, slot: &mut u32, inode: &mut DiskInode) -> KernelResult<u32> {
        if *slot == 0 {
            *slot = self.alloc_block()?;
            inode.blocks += self.sectors_per_block as u32;
        }
        Ok(*slot)
    }

    /// Install `phys` as the mapping of logical block `logical`,
    /// allocating indirect blocks along the way. The caller persists the
    /// inode afterwards. Triple-indirect writes are refused.
    pub fn set_block(
        &self,
        inode: &mut DiskInode,
        logical: u32,
        phys: u32,
    ) -> KernelResult<()> {
        let ppb = self.ptrs_per_block as u64;
        let logical = logical as u64;

        if logical < DIRECT_BLOCKS as u64 {
            inode.block[logical as usize] = phys;
            return Ok(());
        }
        let single_base = DIRECT_BLOCKS as u64;
        if logical < single_base + ppb {
            let idx = (logical - single_base) as usize;
            let mut slot = inode.block[12];
            let ind = self.ensure_slot(&mut slot, inode)?;
            inode.block[12] = slot;
            return self.set_indirect_entry(ind, idx, phys);
        }
        let double_base = single_base + ppb;
        if logical < double_base + ppb * ppb {
            let rel = logical - double_base;
            let mut slot = inode.block[13];
            let l1 = self.ensure_slot(&mut slot, inode)?;
            inode.block[13] = slot;

            let l1_idx = (rel / ppb) as usize;
            let mut l2 = self.indirect_entry(l1, l1_idx)?;
            if l2 == 0 {
                l2 = self.alloc_block()?;
                inode.blocks += self.sectors_per_block as u32;
                self.set_indirect_entry(l1, l1_idx, l2)?;
            }
            return self.set_indirect_entry(l2, (rel % ppb) as usize, phys);
        }
        Err(KernelError::FileTooLarge)
    }

    /// Read file contents; holes read as zeros. Returns bytes read,
    /// clamped to the file size.
    pub fn read_data(&self, ino: u32, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        let inode = self.read_inode(ino)?;
        let size = inode.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let total = buf.len().min(size - offset);

        let mut done = 0;
        while done < total {
            let pos = offset + done;
            let logical = (pos / self.block_size) as u32;
            let in_block = pos % self.block_size;
            let chunk = (self.block_size - in_block).min(total - done);

            let phys = self.get_block(&inode, logical)?;
            if phys == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                let data = self.read_block(phys)?;
                buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Write file contents, allocating blocks and extending the size as
    /// needed. Returns bytes written.
    pub fn write_data(&self, ino: u32, offset: usize, data: &[u8]) -> KernelResult<usize> {
        let mut inode = self.read_inode(ino)?;
        let mut done = 0;

        let result = loop {
            if done == data.len() {
                break Ok(());
            }
            let pos = offset + done;
            let logical = (pos / self.block_size) as u32;
            let in_block = pos % self.block_size;
            let chunk = (self.block_size - in_block).min(data.len() - done);

            let phys = match self.get_block(&inode, logical) {
                Ok(0) => {
                    let new = match self.alloc_block() {
                        Ok(b) => b,
                        Err(e) => break Err(e),
                    };
                    inode.blocks += self.sectors_per_block as u32;
                    if let Err(e) = self.set_block(&mut inode, logical, new) {
                        break Err(e);
                    }
                    new
                }
                Ok(b) => b,
                Err(e) => break Err(e),
            };

            if let Err(e) =
                self.modify_block(phys, |b| {
                    b[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
                })
            {
                break Err(e);
            }
            done += chunk;
        };

        // Metadata moved even on a partial write; persist what happened
        // (mid-operation failures are not rolled back).
        if (offset + done) as u32 > inode.size {
            inode.size = (offset + done) as u32;
        }
        self.write_inode(ino, &inode)?;
        result.map(|()| done)
    }

    /// Free every block in an indirect subtree, the subtree root
    /// included. `depth` 1 is a single-indirect block.
    fn free_indirect(&self, block: u32, depth: u32) -> KernelResult<()> {
        if block == 0 {
            return Ok(());
        }
        if depth > 1 {
            let entries: Vec<u32> = {
                let data = self.read_block(block)?;
                (0..self.ptrs_per_block)
                    .map(|i| u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().expect("4 bytes")))
                    .collect()
            };
            for entry in entries {
                self.free_indirect(entry, depth - 1)?;
            }
        } else {
            let data = self.read_block(block)?;
            for i in 0..self.ptrs_per_block {
                let entry =
                    u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
                if entry != 0 {
                    self.free_block_num(entry)?;
                }
            }
        }
        self.free_block_num(block)
    }

    /// Release all data and indirect blocks and zero the size.
    pub fn truncate(&self, ino: u32) -> KernelResult<()> {
        let mut inode = self.read_inode(ino)?;

        for i in 0..DIRECT_BLOCKS {
            if inode.block[i] != 0 {
                self.free_block_num(inode.block[i])?;
            }
        }
        self.free_indirect(inode.block[12], 1)?;
        self.free_indirect(inode.block[13], 2)?;
        self.free_indirect(inode.block[14], 3)?;

        inode.block = [0; 15];
        inode.size = 0;
        inode.blocks = 0;
        self.write_inode(ino, &inode)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::super::testutil::fresh_fs;
    use super::super::{DiskInode, S_IFREG};
    use super::*;

    fn new_file(fs: &Ext2Fs) -> u32 {
        let ino = fs.alloc_inode(false).unwrap();
        fs.write_inode(ino, &DiskInode::new(S_IFREG | 0o644)).unwrap();
        ino
    }

    #[test]
    fn write_then_read_roundtrip() {
        let fs = fresh_fs();
        let ino = new_file(&fs);

        let n = fs.write_data(ino, 0, b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(fs.stat(ino).unwrap().size, 5);

        let mut out = [0u8; 5];
        assert_eq!(fs.read_data(ino, 0, &mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");

        // i_blocks counts 512-byte sectors: one 1 KiB block = 2 sectors.
        assert_eq!(fs.stat(ino).unwrap().blocks, 2);
    }

    #[test]
    fn reads_clamp_to_size_and_offset() {
        let fs = fresh_fs();
        let ino = new_file(&fs);
        fs.write_data(ino, 0, b"abcdef").unwrap();

        let mut out = [0u8; 16];
        assert_eq!(fs.read_data(ino, 4, &mut out).unwrap(), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(fs.read_data(ino, 100, &mut out).unwrap(), 0);
    }

    #[test]
    fn crossing_into_single_indirect() {
        let fs = fresh_fs();
        let ino = new_file(&fs);

        // 13 blocks: 12 direct + 1 through the single-indirect block.
        let data = vec![0x5Au8; 13 * 1024];
        assert_eq!(fs.write_data(ino, 0, &data).unwrap(), data.len());

        let stat = fs.stat(ino).unwrap();
        assert_eq!(stat.size, 13 * 1024);
        // 13 data blocks + 1 indirect block, 2 sectors each.
        assert_eq!(stat.blocks, 14 * 2);

        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.read_data(ino, 0, &mut back).unwrap(), data.len());
        assert_eq!(back, data);

        let inode = fs.read_inode(ino).unwrap();
        assert_ne!(inode.block[12], 0);
        assert_eq!(fs.get_block(&inode, 12).unwrap(), {
            let d = fs.read_block(inode.block[12]).unwrap();
            u32::from_le_bytes(d[0..4].try_into().unwrap())
        });
    }

    #[test]
    fn sparse_holes_read_as_zeros() {
        let fs = fresh_fs();
        let ino = new_file(&fs);

        // Write one byte far into the file; everything before is a hole.
        fs.write_data(ino, 5000, b"X").unwrap();
        assert_eq!(fs.stat(ino).unwrap().size, 5001);

        let mut out = vec![0xFFu8; 16];
        fs.read_data(ino, 1000, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));

        let mut tail = [0u8; 1];
        fs.read_data(ino, 5000, &mut tail).unwrap();
        assert_eq!(&tail, b"X");

        // Only the one data block (and no indirect) was allocated.
        assert_eq!(fs.stat(ino).unwrap().blocks, 2);
    }

    #[test]
    fn truncate_returns_all_blocks() {
        let fs = fresh_fs();
        let (free_before, _) = fs.free_counts();
        let ino = new_file(&fs);

        let data = vec![1u8; 20 * 1024];
        fs.write_data(ino, 0, &data).unwrap();
        assert!(fs.free_counts().0 < free_before);

        fs.truncate(ino).unwrap();
        assert_eq!(fs.free_counts().0, free_before);
        let stat = fs.stat(ino).unwrap();
        assert_eq!(stat.size, 0);
        assert_eq!(stat.blocks, 0);
    }

    #[test]
    fn overwrite_in_place_does_not_grow() {
        let fs = fresh_fs();
        let ino = new_file(&fs);
        fs.write_data(ino, 0, &vec![7u8; 2048]).unwrap();
        let blocks = fs.stat(ino).unwrap().blocks;

        fs.write_data(ino, 100, b"patch").unwrap();
        assert_eq!(fs.stat(ino).unwrap().blocks, blocks);
        let mut out = [0u8; 5];
        fs.read_data(ino, 100, &mut out).unwrap();
        assert_eq!(&out, b"patch");
    }
}
