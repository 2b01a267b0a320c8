//! Task descriptors
//!
//! A task is one kernel or user thread of control: a 16 KiB kernel stack,
//! the saved stack pointer holding its register frame, the CR3 of its
//! address space (0 for kernel tasks), and its pinned CPU. Descriptors are
//! shared as `Arc<Task>` between the task table, the run queues, and wait
//! lists; hot fields are atomics so the switch path never takes a lock on
//! the descriptor itself.

use alloc::{boxed::Box, string::String, sync::Arc, vec};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::{
    arch::InterruptFrame,
    error::KernelResult,
    fs::file::FdTable,
    mm::AddressSpace,
    sync::Semaphore,
};

/// Kernel stack size per task (16 KiB)
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Task lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot free; descriptor is dead
    Unused = 0,
    /// On a run queue, waiting for CPU time
    Ready = 1,
    /// Executing on its CPU
    Running = 2,
    /// Off-queue, waiting for an explicit wake
    Blocked = 3,
    /// Off-queue, waiting for a tick deadline
    Sleeping = 4,
    /// Exited; resources reclaimed by the next switch that observes it
    Terminated = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Sleeping,
            5 => Self::Terminated,
            _ => Self::Unused,
        }
    }
}

/// A task's kernel stack. 16-byte aligned so a synthesized interrupt
/// frame lands on the alignment IRETQ expects.
pub struct KernelStack {
    mem: Box<[u128]>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            mem: vec![0u128; KERNEL_STACK_SIZE / 16].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    /// Top of the stack (exclusive), 16-byte aligned.
    pub fn top(&self) -> u64 {
        self.base() + KERNEL_STACK_SIZE as u64
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Task control block
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Home CPU; never changes after creation
    pub cpu: usize,
    /// Idle tasks stay off the run queues
    pub is_idle: bool,
    /// Parent task, if any (user tasks)
    pub parent: Option<TaskId>,
    state: AtomicU8,
    /// Whether the task currently sits in a run queue. Guards against
    /// double enqueues when a wake races with the blocking path.
    on_queue: AtomicBool,
    saved_rsp: AtomicU64,
    /// CR3 of the task's address space; 0 for kernel tasks
    cr3: AtomicU64,
    kstack: KernelStack,
    pub exit_code: AtomicI64,
    /// Posted once on exit; `wait` blocks here
    pub exited: Semaphore,
    /// User address space; `None` for kernel tasks
    pub addr_space: Mutex<Option<AddressSpace>>,
    /// Open files
    pub fds: Mutex<FdTable>,
}

impl Task {
    /// Build a ring-0 task that starts at `entry(arg)`.
    pub fn new_kernel(
        id: TaskId,
        name: &str,
        cpu: usize,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> KernelResult<Self> {
        let kstack = KernelStack::new();
        let frame = InterruptFrame::kernel(entry as usize as u64, kstack.top(), arg as u64);
        // SAFETY: `kstack.top()` is the aligned top of a stack this task
        // exclusively owns; nothing runs on it yet.
        let rsp = unsafe { frame.write_to_stack(kstack.top()) };

        Ok(Self {
            id,
            name: String::from(name),
            cpu,
            is_idle: false,
            parent: None,
            state: AtomicU8::new(TaskState::Ready as u8),
            on_queue: AtomicBool::new(false),
            saved_rsp: AtomicU64::new(rsp),
            cr3: AtomicU64::new(0),
            kstack,
            exit_code: AtomicI64::new(0),
            exited: Semaphore::new(0),
            addr_space: Mutex::new(None),
            fds: Mutex::new(FdTable::new()),
        })
    }

    /// Build a ring-3 task entering `entry` on `user_stack_top`, running
    /// in `space`. The ELF loader has already populated the space.
    pub fn new_user(
        id: TaskId,
        name: &str,
        cpu: usize,
        space: AddressSpace,
        entry: u64,
        user_stack_top: u64,
        parent: Option<TaskId>,
    ) -> KernelResult<Self> {
        let kstack = KernelStack::new();
        let frame = InterruptFrame::user(entry, user_stack_top, 0);
        // SAFETY: as in `new_kernel`.
        let rsp = unsafe { frame.write_to_stack(kstack.top()) };
        let cr3 = space.cr3();

        Ok(Self {
            id,
            name: String::from(name),
            cpu,
            is_idle: false,
            parent,
            state: AtomicU8::new(TaskState::Ready as u8),
            on_queue: AtomicBool::new(false),
            saved_rsp: AtomicU64::new(rsp),
            cr3: AtomicU64::new(cr3),
            kstack,
            exit_code: AtomicI64::new(0),
            exited: Semaphore::new(0),
            addr_space: Mutex::new(Some(space)),
            fds: Mutex::new(FdTable::new()),
        })
    }

    /// Build the fork child: a copy of the parent's register frame with
    /// the return value zeroed, running in the cloned address space with
    /// an inherited descriptor table.
    pub fn new_forked(
        id: TaskId,
        name: &str,
        cpu: usize,
        space: AddressSpace,
        parent_frame: &InterruptFrame,
        parent: TaskId,
        fds: FdTable,
    ) -> KernelResult<Self> {
        let kstack = KernelStack::new();
        let mut frame = *parent_frame;
        frame.rax = 0; // fork returns 0 in the child
        // SAFETY: as in `new_kernel`.
        let rsp = unsafe { frame.write_to_stack(kstack.top()) };
        let cr3 = space.cr3();

        Ok(Self {
            id,
            name: String::from(name),
            cpu,
            is_idle: false,
            parent: Some(parent),
            state: AtomicU8::new(TaskState::Ready as u8),
            on_queue: AtomicBool::new(false),
            saved_rsp: AtomicU64::new(rsp),
            cr3: AtomicU64::new(cr3),
            kstack,
            exit_code: AtomicI64::new(0),
            exited: Semaphore::new(0),
            addr_space: Mutex::new(Some(space)),
            fds: Mutex::new(fds),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transition `from -> to` atomically; `Err` carries the actual state.
    pub fn cas_state(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }

    /// Claim the task's run-queue slot. Returns whether it was already
    /// queued (in which case the caller must not enqueue it again).
    pub fn mark_queued(&self) -> bool {
        self.on_queue.swap(true, Ordering::AcqRel)
    }

    /// The task left a run queue.
    pub fn clear_queued(&self) {
        self.on_queue.store(false, Ordering::Release);
    }

    pub fn saved_rsp(&self) -> u64 {
        self.saved_rsp.load(Ordering::Acquire)
    }

    pub fn set_saved_rsp(&self, rsp: u64) {
        self.saved_rsp.store(rsp, Ordering::Release);
    }

    pub fn cr3(&self) -> u64 {
        self.cr3.load(Ordering::Acquire)
    }

    pub fn set_cr3(&self, cr3: u64) {
        self.cr3.store(cr3, Ordering::Release);
    }

    pub fn kstack_top(&self) -> u64 {
        self.kstack.top()
    }

    /// The address-space id this task faults and futexes under (0 for
    /// kernel tasks).
    pub fn asid(&self) -> u64 {
        self.addr_space.lock().as_ref().map_or(0, |s| s.id())
    }
}

/// Shared handle to a task.
pub type TaskRef = Arc<Task>;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil {
    use super::*;

    pub(crate) extern "C" fn spin_entry(_arg: usize) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    /// A ready task pinned to `cpu`, for queue-discipline tests.
    pub(crate) fn dummy_task(id: u64, cpu: usize) -> TaskRef {
        Arc::new(
            Task::new_kernel(TaskId(id), "test", cpu, spin_entry, 0)
                .expect("task construction cannot fail on host"),
        )
    }
}
