//! IPC system calls

use super::{copy_from_user, copy_to_user, read_user_cstr, with_current_space};
use crate::{
    arch::x86_64::percpu,
    error::{KernelError, KernelResult},
    ipc::{registry, IpcFlags, Message, SHM_TABLE},
    mm::FRAME_ALLOCATOR,
    sched,
};

pub fn sys_ipc_create(capacity: usize) -> KernelResult<i64> {
    let port = registry::create(capacity);
    Ok(port.id as i64)
}

pub fn sys_ipc_send(port_id: u32, msg_ptr: u64, len: usize, flags: u32) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let port = registry::get(port_id)?;
    let data = with_current_space(|space| copy_from_user(space, msg_ptr, len))?;

    // Oversized payloads are truncated by the envelope, not rejected.
    let msg = Message::new(task.id.0, 0, &data, percpu::ticks(0));
    port.send(msg, IpcFlags::from_bits_truncate(flags))?;
    Ok(0)
}

pub fn sys_ipc_recv(port_id: u32, buf_ptr: u64, len: usize, flags: u32) -> KernelResult<i64> {
    let port = registry::get(port_id)?;
    let msg = port.recv(IpcFlags::from_bits_truncate(flags))?;
    let n = msg.data().len().min(len);
    with_current_space(|space| copy_to_user(space, buf_ptr, &msg.data()[..n]))?;
    Ok(n as i64)
}

pub fn sys_ipc_lookup(name_ptr: u64) -> KernelResult<i64> {
    let name = with_current_space(|space| read_user_cstr(space, name_ptr))?;
    let port = registry::lookup(&name)?;
    Ok(port.id as i64)
}

pub fn sys_ipc_register(port_id: u32, name_ptr: u64) -> KernelResult<i64> {
    let name = with_current_space(|space| read_user_cstr(space, name_ptr))?;
    registry::register(port_id, &name)?;
    Ok(0)
}

pub fn sys_shmem_create(size: usize) -> KernelResult<i64> {
    let id = SHM_TABLE.create(size, &FRAME_ALLOCATOR)?;
    Ok(id as i64)
}

pub fn sys_shmem_map(id: u32) -> KernelResult<i64> {
    let base = with_current_space(|space| SHM_TABLE.map(id, space, &FRAME_ALLOCATOR))?;
    Ok(base.as_u64() as i64)
}

pub fn sys_shmem_unmap(id: u32) -> KernelResult<i64> {
    with_current_space(|space| SHM_TABLE.unmap(id, space, &FRAME_ALLOCATOR))?;
    Ok(0)
}
