//! Memory-management system calls

use super::with_current_space;
use crate::{
    error::{KernelError, KernelResult},
    mm::{
        vas::alloc_user_frame, PageFlags, VirtualAddress, VmaFlags, VmaKind, FRAME_ALLOCATOR,
        FRAME_SIZE,
    },
};

fn page_align_up(addr: u64) -> u64 {
    (addr + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1)
}

/// Move the program break. `new_brk == 0` queries the current value.
pub fn sys_brk(new_brk: u64) -> KernelResult<i64> {
    with_current_space(|space| {
        let current = space.brk();
        if new_brk == 0 {
            return Ok(current as i64);
        }
        if current == 0 {
            // No image established a break to move.
            return Err(KernelError::Invalid);
        }

        let old_top = page_align_up(current);
        let new_top = page_align_up(new_brk);

        if new_top > old_top {
            for page in (old_top..new_top).step_by(FRAME_SIZE) {
                let frame = alloc_user_frame(&FRAME_ALLOCATOR)?;
                space.map(
                    &FRAME_ALLOCATOR,
                    VirtualAddress::new(page),
                    frame.addr(),
                    PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
                )?;
            }
            space.vmas.lock().insert(
                old_top,
                new_top,
                VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
                VmaKind::Heap,
            )?;
        } else if new_top < old_top {
            for page in (new_top..old_top).step_by(FRAME_SIZE) {
                space.unmap(&FRAME_ALLOCATOR, VirtualAddress::new(page), true)?;
            }
            space.vmas.lock().remove(new_top, old_top)?;
        }

        space.set_brk(new_brk);
        Ok(new_brk as i64)
    })
}

/// Map anonymous, zero-filled memory below the mmap cursor.
pub fn sys_mmap(len: usize) -> KernelResult<i64> {
    if len == 0 {
        return Err(KernelError::Invalid);
    }
    with_current_space(|space| {
        let base = space
            .vmas
            .lock()
            .find_free(len as u64)
            .ok_or(KernelError::OutOfMemory)?;
        let end = base.as_u64() + page_align_up(len as u64);
        space.vmas.lock().insert(
            base.as_u64(),
            end,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
            VmaKind::Anonymous,
        )?;
        for page in (base.as_u64()..end).step_by(FRAME_SIZE) {
            let frame = alloc_user_frame(&FRAME_ALLOCATOR)?;
            space.map(
                &FRAME_ALLOCATOR,
                VirtualAddress::new(page),
                frame.addr(),
                PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
            )?;
        }
        Ok(base.as_u64() as i64)
    })
}

/// Unmap `[addr, addr+len)`, releasing the backing frames.
pub fn sys_munmap(addr: u64, len: usize) -> KernelResult<i64> {
    if addr % FRAME_SIZE as u64 != 0 || len == 0 {
        return Err(KernelError::Invalid);
    }
    with_current_space(|space| {
        let end = addr + page_align_up(len as u64);
        for page in (addr..end).step_by(FRAME_SIZE) {
            // Holes inside the range are tolerated.
            let _ = space.unmap(&FRAME_ALLOCATOR, VirtualAddress::new(page), true);
        }
        space.vmas.lock().remove(addr, end)?;
        Ok(0)
    })
}
