//! Counting semaphore with a FIFO task wait queue
//!
//! `wait` takes a permit or parks the caller; `post` adds a permit and
//! wakes the oldest waiter. The wait loop re-checks the count after every
//! wake, per the blocking protocol: a wake is a hint, not a hand-off.

use alloc::vec::Vec;

use super::spinlock::SpinLock;
use crate::sched::{self, task::TaskRef};

struct SemInner {
    count: u64,
    /// FIFO of parked tasks; index 0 is the oldest
    waiters: Vec<TaskRef>,
}

/// Counting semaphore
pub struct Semaphore {
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub const fn new(count: u64) -> Self {
        Self {
            inner: SpinLock::new(SemInner {
                count,
                waiters: Vec::new(),
            }),
        }
    }

    /// Take a permit without blocking. Returns whether one was taken.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, parking the calling task until one is available.
    ///
    /// The queue lock is never held across the block: enqueue, release,
    /// block, reacquire, recheck.
    pub fn wait(&self) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                    return;
                }
                if let Some(task) = sched::current_task() {
                    inner.waiters.push(task);
                } else {
                    // No scheduler yet (early boot): nothing to park.
                    return;
                }
            }
            sched::block();
        }
    }

    /// Add a permit and wake the oldest waiter, if any.
    pub fn post(&self) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.count += 1;
            if inner.waiters.is_empty() {
                None
            } else {
                Some(inner.waiters.remove(0))
            }
        };
        if let Some(task) = woken {
            sched::unblock(&task);
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Number of parked tasks (diagnostics).
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}
