//! Address-hashed futex table
//!
//! User space points at a 32-bit word; the kernel keys waiters by the
//! word's virtual address *and* the caller's address-space id, so equal
//! addresses in different processes never collide. WAIT validates the
//! expected value under the bucket lock before queueing, closing the
//! lost-wakeup window; WAKE pops up to `n` matching waiters in FIFO
//! order.

use alloc::vec::Vec;

use super::spinlock::SpinLock;
use crate::{
    error::{KernelError, KernelResult},
    mm::VirtualAddress,
    sched::{self, task::TaskRef},
};

/// Number of hash buckets; power of two.
pub const FUTEX_BUCKET_COUNT: usize = 64;

struct Waiter {
    addr: u64,
    asid: u64,
    task: TaskRef,
}

static BUCKETS: [SpinLock<Vec<Waiter>>; FUTEX_BUCKET_COUNT] =
    [const { SpinLock::new(Vec::new()) }; FUTEX_BUCKET_COUNT];

/// Bucket index for (address, address-space id).
fn bucket_index(addr: u64, asid: u64) -> usize {
    // Fibonacci hashing over the word address mixed with the space id.
    let key = (addr >> 2) ^ asid.rotate_left(17);
    (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58) as usize % FUTEX_BUCKET_COUNT
}

/// Park the current task until a wake on `(addr, asid)`.
///
/// `read` loads the current value of the futex word; it runs under the
/// bucket lock so a concurrent WAKE cannot slip between the check and the
/// enqueue. Returns `WouldBlock` when the word no longer holds
/// `expected`.
pub fn wait<F>(addr: VirtualAddress, asid: u64, expected: u32, read: F) -> KernelResult<()>
where
    F: FnOnce() -> KernelResult<u32>,
{
    let idx = bucket_index(addr.as_u64(), asid);
    {
        let mut bucket = BUCKETS[idx].lock();
        let current = read()?;
        if current != expected {
            return Err(KernelError::WouldBlock);
        }
        let Some(task) = sched::current_task() else {
            // Early boot: nothing to park.
            return Ok(());
        };
        bucket.push(Waiter {
            addr: addr.as_u64(),
            asid,
            task,
        });
    }
    sched::block();
    Ok(())
}

/// Wake up to `count` tasks waiting on `(addr, asid)`. Returns how many
/// were woken.
pub fn wake(addr: VirtualAddress, asid: u64, count: usize) -> usize {
    let idx = bucket_index(addr.as_u64(), asid);
    let mut woken = Vec::new();
    {
        let mut bucket = BUCKETS[idx].lock();
        let mut i = 0;
        while i < bucket.len() && woken.len() < count {
            if bucket[i].addr == addr.as_u64() && bucket[i].asid == asid {
                woken.push(bucket.remove(i).task);
            } else {
                i += 1;
            }
        }
    }
    for task in &woken {
        sched::unblock(task);
    }
    woken.len()
}

/// Test hook: queue a specific task as a waiter.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn enqueue_waiter(task: TaskRef, addr: VirtualAddress, asid: u64) {
    let idx = bucket_index(addr.as_u64(), asid);
    BUCKETS[idx].lock().push(Waiter {
        addr: addr.as_u64(),
        asid,
        task,
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::task::testutil::dummy_task;
    use crate::sched::TaskState;

    const ADDR: u64 = 0x6000_1000;

    #[test]
    fn value_mismatch_refuses_to_queue() {
        let result = wait(VirtualAddress::new(ADDR), 901, 5, || Ok(6));
        assert_eq!(result, Err(KernelError::WouldBlock));
        assert_eq!(wake(VirtualAddress::new(ADDR), 901, usize::MAX), 0);
    }

    #[test]
    fn read_errors_propagate() {
        let result = wait(VirtualAddress::new(ADDR), 902, 5, || {
            Err(KernelError::NotFound)
        });
        assert_eq!(result, Err(KernelError::NotFound));
    }

    #[test]
    fn wake_matches_address_and_space() {
        let same_space = 903u64;
        let other_space = 904u64;
        let a = dummy_task(600, 6);
        let b = dummy_task(601, 6);
        let c = dummy_task(602, 6);
        for t in [&a, &b, &c] {
            t.set_state(TaskState::Blocked);
        }

        enqueue_waiter(a.clone(), VirtualAddress::new(ADDR), same_space);
        enqueue_waiter(b.clone(), VirtualAddress::new(ADDR), other_space);
        enqueue_waiter(c.clone(), VirtualAddress::new(ADDR), same_space);

        // Wake one: FIFO within the (addr, asid) key, so `a` goes first;
        // the other address space is untouched.
        assert_eq!(wake(VirtualAddress::new(ADDR), same_space, 1), 1);
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Blocked);
        assert_eq!(c.state(), TaskState::Blocked);

        assert_eq!(wake(VirtualAddress::new(ADDR), same_space, 8), 1);
        assert_eq!(c.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Blocked);

        assert_eq!(wake(VirtualAddress::new(ADDR), other_space, 8), 1);
        assert_eq!(b.state(), TaskState::Ready);
    }

    #[test]
    fn buckets_spread_across_spaces() {
        // Not a distribution proof, just a sanity check that the space id
        // participates in the hash.
        let spread: alloc::collections::BTreeSet<usize> = (0..64u64)
            .map(|asid| bucket_index(ADDR, asid))
            .collect();
        assert!(spread.len() > 8);
    }
}
