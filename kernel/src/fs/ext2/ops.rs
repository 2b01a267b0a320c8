//! Higher-level filesystem operations
//!
//! Create, mkdir, unlink, rmdir, rename, and absolute-path resolution.
//! Metadata changes dirty their cache buffers as they happen; a crash
//! mid-operation (say, between inserting a directory entry and bumping a
//! link count) is not rolled back.

use alloc::string::String;
use alloc::vec;

use super::{dir, DiskInode, Ext2Fs, FT_DIR, FT_REG, ROOT_INO, S_IFDIR, S_IFREG};
use crate::error::{KernelError, KernelResult};

impl Ext2Fs {
    /// Create a regular file in `parent`. Returns the new inode number.
    pub fn create(&self, parent: u32, name: &str, mode: u16) -> KernelResult<u32> {
        if self.dir_lookup(parent, name).is_ok() {
            return Err(KernelError::AlreadyExists);
        }
        let ino = self.alloc_inode(false)?;
        let inode = DiskInode::new(S_IFREG | (mode & 0o7777));
        self.write_inode(ino, &inode)?;
        self.dir_add_entry(parent, name, ino, FT_REG)?;
        Ok(ino)
    }

    /// Create a directory in `parent`: a fresh block with `.` and `..`,
    /// and a link-count bump on the parent (its new child's `..`).
    pub fn mkdir(&self, parent: u32, name: &str, mode: u16) -> KernelResult<u32> {
        if self.dir_lookup(parent, name).is_ok() {
            return Err(KernelError::AlreadyExists);
        }
        let ino = self.alloc_inode(true)?;
        let block = self.alloc_block()?;

        let mut inode = DiskInode::new(S_IFDIR | (mode & 0o7777));
        inode.links_count = 2;
        inode.size = self.block_size as u32;
        inode.blocks = self.sectors_per_block as u32;
        inode.block[0] = block;
        self.write_inode(ino, &inode)?;

        let mut data = vec![0u8; self.block_size];
        dir::write_raw_entry(&mut data, 0, ino, 12, b".", FT_DIR);
        dir::write_raw_entry(
            &mut data,
            12,
            parent,
            (self.block_size - 12) as u16,
            b"..",
            FT_DIR,
        );
        self.write_block(block, &data)?;

        self.dir_add_entry(parent, name, ino, FT_DIR)?;

        let mut parent_inode = self.read_inode(parent)?;
        parent_inode.links_count += 1;
        self.write_inode(parent, &parent_inode)?;
        Ok(ino)
    }

    /// Remove a regular file's directory entry; the inode and its data
    /// are freed when the link count reaches zero.
    pub fn unlink(&self, parent: u32, name: &str) -> KernelResult<()> {
        if name == "." || name == ".." {
            return Err(KernelError::Invalid);
        }
        let ino = self.dir_lookup(parent, name)?;
        let mut inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(KernelError::IsDirectory);
        }

        self.dir_remove_entry(parent, name)?;
        inode.links_count -= 1;
        if inode.links_count == 0 {
            self.truncate(ino)?;
            let mut dead = self.read_inode(ino)?;
            dead.dtime = 1;
            dead.links_count = 0;
            self.write_inode(ino, &dead)?;
            self.free_inode_num(ino, false)?;
        } else {
            self.write_inode(ino, &inode)?;
        }
        Ok(())
    }

    /// Remove an empty directory, dropping the parent's link count.
    pub fn rmdir(&self, parent: u32, name: &str) -> KernelResult<()> {
        if name == "." || name == ".." {
            return Err(KernelError::Invalid);
        }
        let ino = self.dir_lookup(parent, name)?;
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        if !self.dir_is_empty(ino)? {
            return Err(KernelError::NotEmpty);
        }

        self.dir_remove_entry(parent, name)?;
        self.truncate(ino)?;
        let mut dead = self.read_inode(ino)?;
        dead.dtime = 1;
        dead.links_count = 0;
        self.write_inode(ino, &dead)?;
        self.free_inode_num(ino, true)?;

        let mut parent_inode = self.read_inode(parent)?;
        parent_inode.links_count -= 1;
        self.write_inode(parent, &parent_inode)?;
        Ok(())
    }

    /// Rename `old` in `oldp` to `new` in `newp`, replacing any existing
    /// target. A directory moved between parents gets its `..` rewritten
    /// and both parents' link counts fixed up.
    pub fn rename(&self, oldp: u32, old: &str, newp: u32, new: &str) -> KernelResult<()> {
        if old == "." || old == ".." || new == "." || new == ".." {
            return Err(KernelError::Invalid);
        }
        let src = self.dir_lookup(oldp, old)?;
        let src_inode = self.read_inode(src)?;

        if let Ok(target) = self.dir_lookup(newp, new) {
            if target == src {
                return Ok(());
            }
            let target_inode = self.read_inode(target)?;
            if target_inode.is_dir() {
                if !src_inode.is_dir() {
                    return Err(KernelError::IsDirectory);
                }
                self.rmdir(newp, new)?;
            } else {
                if src_inode.is_dir() {
                    return Err(KernelError::NotDirectory);
                }
                self.unlink(newp, new)?;
            }
        }

        let file_type = if src_inode.is_dir() { FT_DIR } else { FT_REG };
        self.dir_add_entry(newp, new, src, file_type)?;
        self.dir_remove_entry(oldp, old)?;

        if src_inode.is_dir() && oldp != newp {
            // The moved directory's `..` now names the new parent.
            self.dir_remove_entry(src, "..")?;
            self.dir_add_entry(src, "..", newp, FT_DIR)?;

            let mut old_parent = self.read_inode(oldp)?;
            old_parent.links_count -= 1;
            self.write_inode(oldp, &old_parent)?;

            let mut new_parent = self.read_inode(newp)?;
            new_parent.links_count += 1;
            self.write_inode(newp, &new_parent)?;
        }
        Ok(())
    }

    /// Resolve an absolute path to an inode number.
    pub fn lookup_path(&self, path: &str) -> KernelResult<u32> {
        if !path.starts_with('/') {
            return Err(KernelError::Invalid);
        }
        let mut ino = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            ino = self.dir_lookup(ino, component)?;
        }
        Ok(ino)
    }

    /// Split a path into its parent's inode and the final component.
    pub fn resolve_parent<'p>(&self, path: &'p str) -> KernelResult<(u32, &'p str)> {
        if !path.starts_with('/') {
            return Err(KernelError::Invalid);
        }
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(KernelError::Invalid);
        }
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => return Err(KernelError::Invalid),
        };
        if name.is_empty() {
            return Err(KernelError::Invalid);
        }
        Ok((self.lookup_path(dir_part)?, name))
    }

    /// `getdents` name list, convenience for the syscall layer.
    pub fn list_names(&self, dir_ino: u32) -> KernelResult<alloc::vec::Vec<String>> {
        Ok(self
            .getdents(dir_ino)?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testutil::fresh_fs;
    use super::*;

    #[test]
    fn create_write_read_unlink_roundtrip() {
        let fs = fresh_fs();
        let (free_blocks, free_inodes) = fs.free_counts();

        let ino = fs.create(ROOT_INO, "a", 0o644).unwrap();
        let stat = fs.stat(ino).unwrap();
        assert_eq!(stat.links, 1);
        assert!(!stat.is_dir);

        fs.write_data(ino, 0, b"hello").unwrap();
        assert_eq!(fs.stat(ino).unwrap().size, 5);
        let mut out = [0u8; 5];
        fs.read_data(ino, 0, &mut out).unwrap();
        assert_eq!(&out, b"hello");

        fs.unlink(ROOT_INO, "a").unwrap();
        assert!(fs.dir_is_empty(ROOT_INO).unwrap());
        assert_eq!(
            fs.dir_lookup(ROOT_INO, "a").unwrap_err(),
            KernelError::NotFound
        );
        // Free-counter round trip: the inode and its block came back.
        assert_eq!(fs.free_counts(), (free_blocks, free_inodes));
    }

    #[test]
    fn create_refuses_duplicates() {
        let fs = fresh_fs();
        fs.create(ROOT_INO, "dup", 0o644).unwrap();
        assert_eq!(
            fs.create(ROOT_INO, "dup", 0o644).unwrap_err(),
            KernelError::AlreadyExists
        );
    }

    #[test]
    fn mkdir_wires_dot_entries_and_link_counts() {
        let fs = fresh_fs();
        let root_links = fs.read_inode(ROOT_INO).unwrap().links_count;

        let d = fs.mkdir(ROOT_INO, "dir", 0o755).unwrap();
        let inode = fs.read_inode(d).unwrap();
        assert!(inode.is_dir());
        assert_eq!(inode.links_count, 2);
        assert_eq!(fs.read_inode(ROOT_INO).unwrap().links_count, root_links + 1);

        assert_eq!(fs.dir_lookup(d, ".").unwrap(), d);
        assert_eq!(fs.dir_lookup(d, "..").unwrap(), ROOT_INO);
        assert!(fs.dir_is_empty(d).unwrap());
    }

    #[test]
    fn unlink_refuses_directories_and_dots() {
        let fs = fresh_fs();
        fs.mkdir(ROOT_INO, "d", 0o755).unwrap();
        assert_eq!(
            fs.unlink(ROOT_INO, "d").unwrap_err(),
            KernelError::IsDirectory
        );
        assert_eq!(fs.unlink(ROOT_INO, ".").unwrap_err(), KernelError::Invalid);
        assert_eq!(fs.unlink(ROOT_INO, "..").unwrap_err(), KernelError::Invalid);
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = fresh_fs();
        let d = fs.mkdir(ROOT_INO, "d", 0o755).unwrap();
        fs.create(d, "inner", 0o644).unwrap();
        assert_eq!(fs.rmdir(ROOT_INO, "d").unwrap_err(), KernelError::NotEmpty);

        fs.unlink(d, "inner").unwrap();
        let root_links = fs.read_inode(ROOT_INO).unwrap().links_count;
        fs.rmdir(ROOT_INO, "d").unwrap();
        assert_eq!(
            fs.read_inode(ROOT_INO).unwrap().links_count,
            root_links - 1
        );
        assert!(fs.dir_lookup(ROOT_INO, "d").is_err());
    }

    #[test]
    fn rename_within_directory() {
        let fs = fresh_fs();
        let ino = fs.create(ROOT_INO, "x", 0o644).unwrap();
        fs.write_data(ino, 0, b"payload").unwrap();

        fs.rename(ROOT_INO, "x", ROOT_INO, "y").unwrap();
        assert!(fs.dir_lookup(ROOT_INO, "x").is_err());
        assert_eq!(fs.dir_lookup(ROOT_INO, "y").unwrap(), ino);

        let mut out = [0u8; 7];
        fs.read_data(ino, 0, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn rename_replaces_existing_target() {
        let fs = fresh_fs();
        let src = fs.create(ROOT_INO, "src", 0o644).unwrap();
        let tgt = fs.create(ROOT_INO, "tgt", 0o644).unwrap();
        fs.write_data(tgt, 0, b"old-data").unwrap();

        let (free_blocks, free_inodes) = fs.free_counts();
        fs.rename(ROOT_INO, "src", ROOT_INO, "tgt").unwrap();

        assert_eq!(fs.dir_lookup(ROOT_INO, "tgt").unwrap(), src);
        assert!(fs.dir_lookup(ROOT_INO, "src").is_err());
        // The replaced file was released with its data block.
        assert_eq!(fs.free_counts(), (free_blocks + 1, free_inodes + 1));
    }

    #[test]
    fn rename_directory_across_parents_updates_dotdot() {
        let fs = fresh_fs();
        let a = fs.mkdir(ROOT_INO, "a", 0o755).unwrap();
        let b = fs.mkdir(ROOT_INO, "b", 0o755).unwrap();
        let d = fs.mkdir(a, "child", 0o755).unwrap();

        let a_links = fs.read_inode(a).unwrap().links_count;
        let b_links = fs.read_inode(b).unwrap().links_count;

        fs.rename(a, "child", b, "moved").unwrap();

        assert!(fs.dir_lookup(a, "child").is_err());
        assert_eq!(fs.dir_lookup(b, "moved").unwrap(), d);
        assert_eq!(fs.dir_lookup(d, "..").unwrap(), b);
        assert_eq!(fs.read_inode(a).unwrap().links_count, a_links - 1);
        assert_eq!(fs.read_inode(b).unwrap().links_count, b_links + 1);
    }

    #[test]
    fn path_resolution() {
        let fs = fresh_fs();
        let a = fs.mkdir(ROOT_INO, "a", 0o755).unwrap();
        let b = fs.mkdir(a, "b", 0o755).unwrap();
        let f = fs.create(b, "f", 0o644).unwrap();

        assert_eq!(fs.lookup_path("/").unwrap(), ROOT_INO);
        assert_eq!(fs.lookup_path("/a").unwrap(), a);
        assert_eq!(fs.lookup_path("/a/b/f").unwrap(), f);
        assert_eq!(fs.lookup_path("/a/./b/../b/f").unwrap(), f);
        assert_eq!(
            fs.lookup_path("/missing").unwrap_err(),
            KernelError::NotFound
        );
        assert_eq!(fs.lookup_path("relative").unwrap_err(), KernelError::Invalid);

        let (parent, name) = fs.resolve_parent("/a/b/f").unwrap();
        assert_eq!((parent, name), (b, "f"));
        let (parent, name) = fs.resolve_parent("/top").unwrap();
        assert_eq!((parent, name), (ROOT_INO, "top"));
    }
}
