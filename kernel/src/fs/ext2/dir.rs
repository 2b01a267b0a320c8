//! Directory entry management
//!
//! Directories are files whose blocks hold 4-byte-aligned variable-length
//! records `{inode, rec_len, name_len, file_type, name}`. A record with
//! inode 0 is a deleted slot. Insertion reuses a deleted slot, splits a
//! live record with spare tail space, or appends a fresh block holding a
//! single record that spans it; removal merges the record into its
//! predecessor or, at the head of a block, zeroes the inode field.

use alloc::{string::String, vec::Vec};

use super::{DiskInode, Ext2Fs};
use crate::error::{KernelError, KernelResult};

/// Fixed part of a directory record
const DIRENT_HEADER: usize = 8;

/// Longest permitted name
const NAME_MAX: usize = 255;

/// A directory entry as returned by `getdents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub ino: u32,
    pub file_type: u8,
    pub name: String,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn record_size(name_len: usize) -> usize {
    align4(DIRENT_HEADER + name_len)
}

/// Decoded record header
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    ino: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

fn read_raw_entry(block: &[u8], off: usize) -> KernelResult<RawEntry> {
    if off + DIRENT_HEADER > block.len() {
        return Err(KernelError::Invalid);
    }
    let entry = RawEntry {
        ino: u32::from_le_bytes(block[off..off + 4].try_into().expect("4 bytes")),
        rec_len: u16::from_le_bytes(block[off + 4..off + 6].try_into().expect("2 bytes")),
        name_len: block[off + 6],
        file_type: block[off + 7],
    };
    let len = entry.rec_len as usize;
    if len < DIRENT_HEADER || len % 4 != 0 || off + len > block.len() {
        return Err(KernelError::Invalid);
    }
    Ok(entry)
}

/// Serialize a record at `off`. Shared with the formatter, which lays
/// out the root directory by hand.
pub(crate) fn write_raw_entry(
    block: &mut [u8],
    off: usize,
    ino: u32,
    rec_len: u16,
    name: &[u8],
    file_type: u8,
) {
    block[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    block[off + DIRENT_HEADER..off + DIRENT_HEADER + name.len()].copy_from_slice(name);
}

impl Ext2Fs {
    fn require_dir(&self, ino: u32) -> KernelResult<DiskInode> {
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        Ok(inode)
    }

    /// Look a name up in a directory.
    pub fn dir_lookup(&self, dir_ino: u32, name: &str) -> KernelResult<u32> {
        let dir = self.require_dir(dir_ino)?;
        let blocks = dir.size as usize / self.block_size;
        for logical in 0..blocks {
            let phys = self.get_block(&dir, logical as u32)?;
            if phys == 0 {
                continue;
            }
            let data = self.read_block(phys)?;
            let mut off = 0;
            while off < self.block_size {
                let entry = read_raw_entry(&data, off)?;
                if entry.ino != 0
                    && entry.name_len as usize == name.len()
                    && &data[off + DIRENT_HEADER..off + DIRENT_HEADER + name.len()]
                        == name.as_bytes()
                {
                    return Ok(entry.ino);
                }
                off += entry.rec_len as usize;
            }
        }
        Err(KernelError::NotFound)
    }

    /// Enumerate a directory's live entries.
    pub fn getdents(&self, dir_ino: u32) -> KernelResult<Vec<DirEntryInfo>> {
        let dir = self.require_dir(dir_ino)?;
        let mut out = Vec::new();
        let blocks = dir.size as usize / self.block_size;
        for logical in 0..blocks {
            let phys = self.get_block(&dir, logical as u32)?;
            if phys == 0 {
                continue;
            }
            let data = self.read_block(phys)?;
            let mut off = 0;
            while off < self.block_size {
                let entry = read_raw_entry(&data, off)?;
                if entry.ino != 0 {
                    let name_bytes =
                        &data[off + DIRENT_HEADER..off + DIRENT_HEADER + entry.name_len as usize];
                    out.push(DirEntryInfo {
                        ino: entry.ino,
                        file_type: entry.file_type,
                        name: String::from_utf8_lossy(name_bytes).into_owned(),
                    });
                }
                off += entry.rec_len as usize;
            }
        }
        Ok(out)
    }

    /// A directory is empty when nothing but `.` and `..` remains.
    pub fn dir_is_empty(&self, dir_ino: u32) -> KernelResult<bool> {
        Ok(self
            .getdents(dir_ino)?
            .iter()
            .all(|e| e.name == "." || e.name == ".."))
    }

    /// Insert `name -> ino`. Reuses a deleted slot, splits a live record
    /// with enough spare tail, or appends a fresh directory block.
    pub fn dir_add_entry(
        &self,
        dir_ino: u32,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> KernelResult<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(KernelError::Invalid);
        }
        let mut dir = self.require_dir(dir_ino)?;
        let needed = record_size(name.len());

        let blocks = dir.size as usize / self.block_size;
        for logical in 0..blocks {
            let phys = self.get_block(&dir, logical as u32)?;
            if phys == 0 {
                continue;
            }
            let mut data = self.read_block(phys)?;
            let mut off = 0;
            while off < self.block_size {
                let entry = read_raw_entry(&data, off)?;
                let rec_len = entry.rec_len as usize;

                if entry.ino == 0 && rec_len >= needed {
                    // Reuse the deleted slot, keeping its rec_len.
                    write_raw_entry(
                        &mut data,
                        off,
                        ino,
                        entry.rec_len,
                        name.as_bytes(),
                        file_type,
                    );
                    return self.write_block(phys, &data);
                }

                if entry.ino != 0 {
                    let used = record_size(entry.name_len as usize);
                    if rec_len >= used + needed {
                        // Split: the live record shrinks to its true
                        // size, the newcomer takes the tail.
                        let tail = (rec_len - used) as u16;
                        data[off + 4..off + 6].copy_from_slice(&(used as u16).to_le_bytes());
                        write_raw_entry(
                            &mut data,
                            off + used,
                            ino,
                            tail,
                            name.as_bytes(),
                            file_type,
                        );
                        return self.write_block(phys, &data);
                    }
                }
                off += rec_len;
            }
        }

        // No room: append a block holding one spanning record.
        let phys = self.alloc_block()?;
        dir.blocks += self.sectors_per_block as u32;
        self.set_block(&mut dir, blocks as u32, phys)?;
        dir.size += self.block_size as u32;
        self.write_inode(dir_ino, &dir)?;

        self.modify_block(phys, |data| {
            write_raw_entry(
                data,
                0,
                ino,
                self.block_size as u16,
                name.as_bytes(),
                file_type,
            );
        })
    }

    /// Remove `name`, merging its record into the predecessor (or
    /// zeroing the inode field for a block-initial record).
    pub fn dir_remove_entry(&self, dir_ino: u32, name: &str) -> KernelResult<()> {
        let dir = self.require_dir(dir_ino)?;
        let blocks = dir.size as usize / self.block_size;
        for logical in 0..blocks {
            let phys = self.get_block(&dir, logical as u32)?;
            if phys == 0 {
                continue;
            }
            let mut data = self.read_block(phys)?;
            let mut prev: Option<usize> = None;
            let mut off = 0;
            while off < self.block_size {
                let entry = read_raw_entry(&data, off)?;
                if entry.ino != 0
                    && entry.name_len as usize == name.len()
                    && &data[off + DIRENT_HEADER..off + DIRENT_HEADER + name.len()]
                        == name.as_bytes()
                {
                    match prev {
                        Some(p) => {
                            // Fold this record's space into the previous.
                            let prev_entry = read_raw_entry(&data, p)?;
                            let merged = prev_entry.rec_len + entry.rec_len;
                            data[p + 4..p + 6].copy_from_slice(&merged.to_le_bytes());
                        }
                        None => {
                            data[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                        }
                    }
                    return self.write_block(phys, &data);
                }
                prev = Some(off);
                off += entry.rec_len as usize;
            }
        }
        Err(KernelError::NotFound)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testutil::fresh_fs;
    use super::super::{DiskInode, FT_REG, ROOT_INO, S_IFREG};
    use super::*;

    fn add_file(fs: &Ext2Fs, name: &str) -> u32 {
        let ino = fs.alloc_inode(false).unwrap();
        fs.write_inode(ino, &DiskInode::new(S_IFREG | 0o644)).unwrap();
        fs.dir_add_entry(ROOT_INO, name, ino, FT_REG).unwrap();
        ino
    }

    #[test]
    fn root_starts_with_dot_entries() {
        let fs = fresh_fs();
        let entries = fs.getdents(ROOT_INO).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", ".."]);
        assert_eq!(fs.dir_lookup(ROOT_INO, ".").unwrap(), ROOT_INO);
        assert!(fs.dir_is_empty(ROOT_INO).unwrap());
    }

    #[test]
    fn add_splits_spanning_record_and_both_are_found() {
        let fs = fresh_fs();
        // ".." spans the rest of the root block; inserting splits it.
        let x = add_file(&fs, "x");
        let yy = add_file(&fs, "yy");

        assert_eq!(fs.dir_lookup(ROOT_INO, "x").unwrap(), x);
        assert_eq!(fs.dir_lookup(ROOT_INO, "yy").unwrap(), yy);
        assert_eq!(fs.dir_lookup(ROOT_INO, "..").unwrap(), ROOT_INO);
        assert!(!fs.dir_is_empty(ROOT_INO).unwrap());

        // Record chain still tiles the block exactly.
        let entries = fs.getdents(ROOT_INO).unwrap();
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn remove_merges_into_predecessor() {
        let fs = fresh_fs();
        let _a = add_file(&fs, "aa");
        let b = add_file(&fs, "bb");
        let _c = add_file(&fs, "cc");

        fs.dir_remove_entry(ROOT_INO, "bb").unwrap();
        assert_eq!(
            fs.dir_lookup(ROOT_INO, "bb").unwrap_err(),
            KernelError::NotFound
        );
        // Neighbors survive the merge.
        assert!(fs.dir_lookup(ROOT_INO, "aa").is_ok());
        assert!(fs.dir_lookup(ROOT_INO, "cc").is_ok());

        // The reclaimed space is reusable.
        let again = add_file(&fs, "bb");
        assert_eq!(fs.dir_lookup(ROOT_INO, "bb").unwrap(), again);
        let _ = b;
    }

    #[test]
    fn directory_grows_a_new_block_when_full() {
        let fs = fresh_fs();
        let size_before = fs.read_inode(ROOT_INO).unwrap().size;

        // Long names exhaust the first block quickly.
        for i in 0..40 {
            let name = alloc::format!("file-with-a-rather-long-name-{:02}", i);
            add_file(&fs, &name);
        }
        let size_after = fs.read_inode(ROOT_INO).unwrap().size;
        assert!(size_after > size_before);
        assert_eq!(size_after as usize % fs.block_size, 0);

        for i in 0..40 {
            let name = alloc::format!("file-with-a-rather-long-name-{:02}", i);
            assert!(fs.dir_lookup(ROOT_INO, &name).is_ok(), "{} lost", name);
        }
    }

    #[test]
    fn lookup_on_regular_file_is_not_directory() {
        let fs = fresh_fs();
        let ino = add_file(&fs, "plain");
        assert_eq!(
            fs.dir_lookup(ino, "anything").unwrap_err(),
            KernelError::NotDirectory
        );
    }

    #[test]
    fn bad_names_are_rejected() {
        let fs = fresh_fs();
        assert_eq!(
            fs.dir_add_entry(ROOT_INO, "", 11, FT_REG).unwrap_err(),
            KernelError::Invalid
        );
        assert_eq!(
            fs.dir_add_entry(ROOT_INO, "a/b", 11, FT_REG).unwrap_err(),
            KernelError::Invalid
        );
    }
}
