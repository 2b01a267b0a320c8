//! System call interface
//!
//! The architecture stub saves the caller's frame and hands register
//! arguments to [`dispatch`]. Return convention: non-negative values are
//! success (often a resource id), negative values are errno codes from
//! [`KernelError::errno`]. User pointers are validated by walking the
//! caller's page tables; nothing is ever dereferenced through a raw user
//! address.

mod futex_call;
mod io;
mod ipc_call;
mod memory;
mod process;
mod time;

use alloc::{string::String, vec, vec::Vec};

use crate::{
    arch::InterruptFrame,
    error::{KernelError, KernelResult},
    mm::{phys_to_virt, AddressSpace, VirtualAddress, FRAME_SIZE},
};

/// System call numbers (kernel ABI)
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Stat = 5,
    Mkdir = 6,
    Unlink = 7,
    Rename = 8,
    Getdents = 9,
    Brk = 10,
    Mmap = 11,
    Munmap = 12,
    GetPid = 13,
    Fork = 14,
    Execve = 15,
    Wait = 16,
    Kill = 17,
    Yield = 18,
    ClockGettime = 19,
    Futex = 20,
    IpcCreate = 32,
    IpcSend = 33,
    IpcRecv = 34,
    IpcLookup = 35,
    IpcRegister = 36,
    ShmemCreate = 37,
    ShmemMap = 38,
    ShmemUnmap = 39,
}

impl TryFrom<usize> for Syscall {
    type Error = KernelError;

    fn try_from(nr: usize) -> Result<Self, Self::Error> {
        Ok(match nr {
            0 => Self::Exit,
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Stat,
            6 => Self::Mkdir,
            7 => Self::Unlink,
            8 => Self::Rename,
            9 => Self::Getdents,
            10 => Self::Brk,
            11 => Self::Mmap,
            12 => Self::Munmap,
            13 => Self::GetPid,
            14 => Self::Fork,
            15 => Self::Execve,
            16 => Self::Wait,
            17 => Self::Kill,
            18 => Self::Yield,
            19 => Self::ClockGettime,
            20 => Self::Futex,
            32 => Self::IpcCreate,
            33 => Self::IpcSend,
            34 => Self::IpcRecv,
            35 => Self::IpcLookup,
            36 => Self::IpcRegister,
            37 => Self::ShmemCreate,
            38 => Self::ShmemMap,
            39 => Self::ShmemUnmap,
            _ => return Err(KernelError::Invalid),
        })
    }
}

/// Dispatch one system call. `frame` is the caller's saved register
/// frame; `fork` copies it and `execve` rewrites it.
pub fn dispatch(nr: usize, args: [u64; 5], frame: &mut InterruptFrame) -> i64 {
    let result = match Syscall::try_from(nr) {
        Ok(call) => handle(call, args, frame),
        Err(e) => Err(e),
    };
    match result {
        Ok(value) => value,
        Err(e) => e.errno(),
    }
}

fn handle(call: Syscall, args: [u64; 5], frame: &mut InterruptFrame) -> KernelResult<i64> {
    match call {
        Syscall::Exit => process::sys_exit(args[0] as i64),
        Syscall::Read => io::sys_read(args[0] as usize, args[1], args[2] as usize),
        Syscall::Write => io::sys_write(args[0] as usize, args[1], args[2] as usize),
        Syscall::Open => io::sys_open(args[0], args[1] as u32),
        Syscall::Close => io::sys_close(args[0] as usize),
        Syscall::Stat => io::sys_stat(args[0], args[1]),
        Syscall::Mkdir => io::sys_mkdir(args[0]),
        Syscall::Unlink => io::sys_unlink(args[0]),
        Syscall::Rename => io::sys_rename(args[0], args[1]),
        Syscall::Getdents => io::sys_getdents(args[0] as usize, args[1], args[2] as usize),
        Syscall::Brk => memory::sys_brk(args[0]),
        Syscall::Mmap => memory::sys_mmap(args[0] as usize),
        Syscall::Munmap => memory::sys_munmap(args[0], args[1] as usize),
        Syscall::GetPid => process::sys_getpid(),
        Syscall::Fork => process::sys_fork(frame),
        Syscall::Execve => process::sys_execve(args[0], frame),
        Syscall::Wait => process::sys_wait(args[0]),
        Syscall::Kill => process::sys_kill(args[0]),
        Syscall::Yield => process::sys_yield(),
        Syscall::ClockGettime => time::sys_clock_gettime(),
        Syscall::Futex => futex_call::sys_futex(args[0] as u32, args[1], args[2], args[3]),
        Syscall::IpcCreate => ipc_call::sys_ipc_create(args[0] as usize),
        Syscall::IpcSend => {
            ipc_call::sys_ipc_send(args[0] as u32, args[1], args[2] as usize, args[3] as u32)
        }
        Syscall::IpcRecv => {
            ipc_call::sys_ipc_recv(args[0] as u32, args[1], args[2] as usize, args[3] as u32)
        }
        Syscall::IpcLookup => ipc_call::sys_ipc_lookup(args[0]),
        Syscall::IpcRegister => ipc_call::sys_ipc_register(args[0] as u32, args[1]),
        Syscall::ShmemCreate => ipc_call::sys_shmem_create(args[0] as usize),
        Syscall::ShmemMap => ipc_call::sys_shmem_map(args[0] as u32),
        Syscall::ShmemUnmap => ipc_call::sys_shmem_unmap(args[0] as u32),
    }
}

/// Upper bound accepted for user pathnames and I/O in one call.
const USER_COPY_MAX: usize = 1 << 20;

/// Copy bytes out of a user address space, page by page through the
/// HHDM. Unmapped pages fail the whole copy.
pub(crate) fn copy_from_user(
    space: &AddressSpace,
    va: u64,
    len: usize,
) -> KernelResult<Vec<u8>> {
    if len > USER_COPY_MAX {
        return Err(KernelError::Invalid);
    }
    let mut out = vec![0u8; len];
    let mut done = 0;
    while done < len {
        let addr = va + done as u64;
        let pa = space
            .translate(VirtualAddress::new(addr))
            .ok_or(KernelError::Invalid)?;
        let in_page = (addr % FRAME_SIZE as u64) as usize;
        let chunk = (FRAME_SIZE - in_page).min(len - done);
        // SAFETY: `pa` was produced by the page-table walk, so the frame
        // is live RAM mapped by the HHDM; the chunk stays in one page.
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(pa), out[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(out)
}

/// Copy bytes into a user address space.
pub(crate) fn copy_to_user(space: &AddressSpace, va: u64, data: &[u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < data.len() {
        let addr = va + done as u64;
        let pa = space
            .translate(VirtualAddress::new(addr))
            .ok_or(KernelError::Invalid)?;
        let in_page = (addr % FRAME_SIZE as u64) as usize;
        let chunk = (FRAME_SIZE - in_page).min(data.len() - done);
        // SAFETY: as in `copy_from_user`; the destination frame is live
        // and the chunk stays in one page.
        unsafe {
            core::ptr::copy_nonoverlapping(data[done..].as_ptr(), phys_to_virt(pa), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Read a NUL-terminated user string (path arguments).
pub(crate) fn read_user_cstr(space: &AddressSpace, va: u64) -> KernelResult<String> {
    const PATH_MAX: usize = 4096;
    let mut bytes = Vec::new();
    loop {
        if bytes.len() >= PATH_MAX {
            return Err(KernelError::Invalid);
        }
        let chunk = copy_from_user(space, va + bytes.len() as u64, 1)?;
        if chunk[0] == 0 {
            break;
        }
        bytes.push(chunk[0]);
    }
    String::from_utf8(bytes).map_err(|_| KernelError::Invalid)
}

/// The calling task's address space, for user-pointer arguments.
pub(crate) fn with_current_space<R>(
    f: impl FnOnce(&mut AddressSpace) -> KernelResult<R>,
) -> KernelResult<R> {
    let task = crate::sched::current_task().ok_or(KernelError::Invalid)?;
    let mut guard = task.addr_space.lock();
    let space = guard.as_mut().ok_or(KernelError::Invalid)?;
    f(space)
}
