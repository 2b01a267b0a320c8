//! Futex system call

use super::with_current_space;
use crate::{
    error::{KernelError, KernelResult},
    mm::{phys_to_virt, VirtualAddress},
    sched,
    sync::futex,
};

const FUTEX_WAIT: u32 = 0;
const FUTEX_WAKE: u32 = 1;

/// `futex(op, addr, val, count)` on a 32-bit user word.
///
/// WAIT validates `*addr == val` under the bucket lock and parks the
/// caller; WAKE releases up to `count` waiters on the same
/// (address, address-space) key.
pub fn sys_futex(op: u32, addr: u64, val: u64, count: u64) -> KernelResult<i64> {
    if addr % 4 != 0 {
        return Err(KernelError::Invalid);
    }
    let task = sched::current_task().ok_or(KernelError::Invalid)?;
    let asid = task.asid();

    match op {
        FUTEX_WAIT => {
            // Resolve the word up front; the validating read must not
            // hold the address-space lock across the block.
            let pa = with_current_space(|space| {
                space
                    .translate(VirtualAddress::new(addr))
                    .ok_or(KernelError::Invalid)
            })?;
            futex::wait(VirtualAddress::new(addr), asid, val as u32, || {
                // SAFETY: `pa` came from the caller's live page tables;
                // the frame stays referenced while the task exists.
                let word = unsafe { core::ptr::read_volatile(phys_to_virt(pa) as *const u32) };
                Ok(word)
            })?;
            Ok(0)
        }
        FUTEX_WAKE => Ok(futex::wake(VirtualAddress::new(addr), asid, count as usize) as i64),
        _ => Err(KernelError::Invalid),
    }
}
