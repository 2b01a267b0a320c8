//! Preemptive SMP scheduler
//!
//! Each CPU owns a FIFO ready queue and exactly one `current` task, both
//! behind that CPU's IRQ-safe spinlock. The per-CPU timer interrupt is the
//! only involuntary preemption point; voluntary yields raise a software
//! interrupt that lands in the same switch path. Tasks are pinned to the
//! CPU chosen round-robin at creation.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    block, current_task, exit, kill, sleep_ticks, spawn_kernel, spawn_user, unblock, wait_for,
    yield_now,
};
pub use task::{Task, TaskId, TaskState, KERNEL_STACK_SIZE};

/// Maximum live tasks system-wide (bounds the per-CPU ring queues).
pub const MAX_TASKS: usize = 256;
