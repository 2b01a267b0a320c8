//! Process-lifecycle system calls

use alloc::vec;

use super::{read_user_cstr, with_current_space};
use crate::{
    arch::{self, InterruptFrame},
    elf,
    error::{KernelError, KernelResult},
    fs,
    mm::{
        vas::{alloc_user_frame, USER_STACK_TOP},
        AddressSpace, PageFlags, VirtualAddress, VmaFlags, VmaKind, FRAME_ALLOCATOR, FRAME_SIZE,
    },
    sched::{self, scheduler, Task, TaskId},
};

/// Pages of user stack handed to a fresh executable.
const USER_STACK_PAGES: u64 = 8;

pub fn sys_exit(code: i64) -> KernelResult<i64> {
    sched::exit(code)
}

pub fn sys_getpid() -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    Ok(task.id.0 as i64)
}

pub fn sys_yield() -> KernelResult<i64> {
    sched::yield_now();
    Ok(0)
}

/// Fork the calling task: clone the address space copy-on-write, copy
/// the saved register frame with a zeroed return value, inherit the
/// descriptor table, and enqueue the child on its own CPU.
pub fn sys_fork(frame: &InterruptFrame) -> KernelResult<i64> {
    let parent = sched::current_task().ok_or(KernelError::Invalid)?;

    let child_space = {
        let mut guard = parent.addr_space.lock();
        let space = guard.as_mut().ok_or(KernelError::Invalid)?;
        space.clone_for_fork(&FRAME_ALLOCATOR)?
    };
    let fds = parent.fds.lock().clone_for_fork();

    let (id, cpu) = scheduler::allocate_task_slot();
    let child = Task::new_forked(id, &parent.name, cpu, child_space, frame, parent.id, fds)?;
    scheduler::adopt(child);
    Ok(id.0 as i64)
}

/// Replace the calling task's image: load the executable into a fresh
/// address space, build a user stack, swap CR3, and rewrite the saved
/// frame so the interrupt return lands at the new entry point.
pub fn sys_execve(path_ptr: u64, frame: &mut InterruptFrame) -> KernelResult<i64> {
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let path = with_current_space(|space| read_user_cstr(space, path_ptr))?;

    let root = fs::root()?;
    let ino = root.lookup_path(&path)?;
    let stat = root.stat(ino)?;
    if stat.is_dir {
        return Err(KernelError::IsDirectory);
    }
    let mut image = vec![0u8; stat.size as usize];
    root.read_data(ino, 0, &mut image)?;

    let mut space = AddressSpace::new(&FRAME_ALLOCATOR)?;
    let loaded = elf::loader()?.load(&mut space, &FRAME_ALLOCATOR, &image)?;
    space.set_brk(loaded.brk);

    let stack_base = USER_STACK_TOP - USER_STACK_PAGES * FRAME_SIZE as u64;
    for i in 0..USER_STACK_PAGES {
        let page = alloc_user_frame(&FRAME_ALLOCATOR)?;
        space.map(
            &FRAME_ALLOCATOR,
            VirtualAddress::new(stack_base + i * FRAME_SIZE as u64),
            page.addr(),
            PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
        )?;
    }
    space.vmas.lock().insert(
        stack_base,
        USER_STACK_TOP,
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
        VmaKind::Stack,
    )?;

    // Swap the spaces; the old one is torn down after the new CR3 is
    // live (the kernel half is shared, so this code keeps running).
    let new_cr3 = space.cr3();
    let old = task.addr_space.lock().replace(space);
    task.set_cr3(new_cr3);
    // SAFETY: `new_cr3` roots a space whose kernel half was copied from
    // the boot tables.
    unsafe { arch::load_cr3(new_cr3) };
    if let Some(mut old_space) = old {
        old_space.destroy(&FRAME_ALLOCATOR);
    }

    *frame = InterruptFrame::user(loaded.entry, USER_STACK_TOP, 0);
    Ok(0)
}

/// Wait for a child to exit; returns its exit code.
pub fn sys_wait(pid: u64) -> KernelResult<i64> {
    scheduler::wait_for(TaskId(pid))
}

pub fn sys_kill(pid: u64) -> KernelResult<i64> {
    scheduler::kill(TaskId(pid))?;
    Ok(0)
}
