//! Kernel synchronization primitives
//!
//! Three layers: the IRQ-safe [`SpinLock`] for state touched from the
//! switch path, the counting [`Semaphore`] for task-level waiting, and the
//! address-hashed [`futex`] table backing the user-space fast locks.
//! Plain data that never crosses the scheduler uses `spin::Mutex`
//! directly.

pub mod futex;
pub mod semaphore;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
