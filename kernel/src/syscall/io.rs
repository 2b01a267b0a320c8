//! File and directory system calls
//!
//! Descriptors 0..3 are the console; everything else goes through the
//! calling task's descriptor table to the root ext2 volume.

use alloc::vec;

use super::{copy_from_user, copy_to_user, read_user_cstr, with_current_space};
use crate::{
    error::{KernelError, KernelResult},
    fs::{self, file::STDERR, OpenFlags},
    sched,
};

/// `stat` result as written to user space.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserStat {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub links: u32,
    /// 512-byte sectors allocated
    pub blocks: u32,
    /// 1 = directory, 0 = regular file
    pub is_dir: u32,
}

pub fn sys_open(path_ptr: u64, flag_bits: u32) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let flags = OpenFlags::from_bits(flag_bits)?;
    let path = with_current_space(|space| read_user_cstr(space, path_ptr))?;
    let root = fs::root()?;

    let ino = match root.lookup_path(&path) {
        Ok(ino) => ino,
        Err(KernelError::NotFound) if flags.create => {
            let (parent, name) = root.resolve_parent(&path)?;
            root.create(parent, name, 0o644)?
        }
        Err(e) => return Err(e),
    };

    let stat = root.stat(ino)?;
    if stat.is_dir && flags.write {
        return Err(KernelError::IsDirectory);
    }
    if flags.truncate && flags.write {
        root.truncate(ino)?;
    }

    let fd = task.fds.lock().open(ino, flags)?;
    Ok(fd as i64)
}

pub fn sys_close(fd: usize) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    task.fds.lock().close(fd)?;
    Ok(0)
}

/// Largest transfer served by one read/write/getdents call.
const IO_MAX: usize = 1 << 20;

pub fn sys_read(fd: usize, buf: u64, len: usize) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let len = len.min(IO_MAX);
    if fd <= STDERR {
        // Console input is outside the core; report end-of-input.
        return Ok(0);
    }

    let (ino, offset, flags) = {
        let fds = task.fds.lock();
        let file = fds.get(fd).ok_or(KernelError::Invalid)?;
        (file.ino, file.offset, file.flags)
    };
    if !flags.read {
        return Err(KernelError::Invalid);
    }

    let root = fs::root()?;
    let mut data = vec![0u8; len];
    let n = root.read_data(ino, offset as usize, &mut data)?;
    with_current_space(|space| copy_to_user(space, buf, &data[..n]))?;

    if let Some(file) = task.fds.lock().get_mut(fd) {
        file.offset = offset + n as u64;
    }
    Ok(n as i64)
}

pub fn sys_write(fd: usize, buf: u64, len: usize) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let data = with_current_space(|space| copy_from_user(space, buf, len))?;

    if fd <= STDERR {
        crate::print!("{}", alloc::string::String::from_utf8_lossy(&data));
        return Ok(len as i64);
    }

    let (ino, offset, flags) = {
        let fds = task.fds.lock();
        let file = fds.get(fd).ok_or(KernelError::Invalid)?;
        (file.ino, file.offset, file.flags)
    };
    if !flags.write {
        return Err(KernelError::Invalid);
    }

    let root = fs::root()?;
    let offset = if flags.append {
        root.stat(ino)?.size
    } else {
        offset
    };
    let n = root.write_data(ino, offset as usize, &data)?;

    if let Some(file) = task.fds.lock().get_mut(fd) {
        file.offset = offset + n as u64;
    }
    Ok(n as i64)
}

pub fn sys_stat(path_ptr: u64, stat_ptr: u64) -> KernelResult<i64> {
    let path = with_current_space(|space| read_user_cstr(space, path_ptr))?;
    let root = fs::root()?;
    let stat = root.stat(root.lookup_path(&path)?)?;

    let user_stat = UserStat {
        ino: stat.ino as u64,
        size: stat.size,
        mode: stat.mode as u32,
        links: stat.links as u32,
        blocks: stat.blocks,
        is_dir: stat.is_dir as u32,
    };
    // SAFETY: UserStat is plain-old-data; this views it as bytes.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &user_stat as *const UserStat as *const u8,
            core::mem::size_of::<UserStat>(),
        )
    };
    with_current_space(|space| copy_to_user(space, stat_ptr, bytes))?;
    Ok(0)
}

pub fn sys_mkdir(path_ptr: u64) -> KernelResult<i64> {
    let path = with_current_space(|space| read_user_cstr(space, path_ptr))?;
    let root = fs::root()?;
    let (parent, name) = root.resolve_parent(&path)?;
    root.mkdir(parent, name, 0o755)?;
    Ok(0)
}

/// Remove a name: files are unlinked, empty directories removed.
pub fn sys_unlink(path_ptr: u64) -> KernelResult<i64> {
    let path = with_current_space(|space| read_user_cstr(space, path_ptr))?;
    let root = fs::root()?;
    let (parent, name) = root.resolve_parent(&path)?;
    match root.unlink(parent, name) {
        Err(KernelError::IsDirectory) => root.rmdir(parent, name)?,
        other => other?,
    }
    Ok(0)
}

pub fn sys_rename(old_ptr: u64, new_ptr: u64) -> KernelResult<i64> {
    let (old_path, new_path) = with_current_space(|space| {
        Ok((
            read_user_cstr(space, old_ptr)?,
            read_user_cstr(space, new_ptr)?,
        ))
    })?;
    let root = fs::root()?;
    let (old_parent, old_name) = root.resolve_parent(&old_path)?;
    let (new_parent, new_name) = root.resolve_parent(&new_path)?;
    root.rename(old_parent, old_name, new_parent, new_name)?;
    Ok(0)
}

/// Directory records as written to user space: `{ino u64, rec_len u16,
/// file_type u8, name, NUL}`, 8-byte aligned. The descriptor offset is
/// the index of the next entry to emit.
pub fn sys_getdents(fd: usize, buf: u64, len: usize) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let len = len.min(IO_MAX);
    let (ino, skip) = {
        let fds = task.fds.lock();
        let file = fds.get(fd).ok_or(KernelError::Invalid)?;
        (file.ino, file.offset as usize)
    };

    let root = fs::root()?;
    let entries = root.getdents(ino)?;

    let mut out = vec![0u8; len];
    let mut written = 0;
    let mut emitted = 0;
    for entry in entries.iter().skip(skip) {
        let rec_len = (8 + 2 + 1 + entry.name.len() + 1 + 7) & !7;
        if written + rec_len > len {
            break;
        }
        out[written..written + 8].copy_from_slice(&(entry.ino as u64).to_le_bytes());
        out[written + 8..written + 10].copy_from_slice(&(rec_len as u16).to_le_bytes());
        out[written + 10] = entry.file_type;
        out[written + 11..written + 11 + entry.name.len()]
            .copy_from_slice(entry.name.as_bytes());
        written += rec_len;
        emitted += 1;
    }

    with_current_space(|space| copy_to_user(space, buf, &out[..written]))?;
    if let Some(file) = task.fds.lock().get_mut(fd) {
        file.offset = (skip + emitted) as u64;
    }
    Ok(written as i64)
}
