//! The switch path and task lifecycle
//!
//! `switch` is the single scheduling decision point, entered from the
//! timer interrupt and from the yield software interrupt with the
//! interrupted task's register frame already on its kernel stack. It runs
//! under the CPU's queue lock with interrupts disabled and returns the
//! stack pointer to resume.
//!
//! A terminated task cannot free the kernel stack it is still executing
//! on, so cleanup is deferred: the switch that sees a TERMINATED outgoing
//! task parks it on the CPU's reap list, and a later switch (running on a
//! different stack) frees it.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::{
    queue::RunQueue,
    task::{Task, TaskRef},
    TaskId, TaskState,
};
use crate::{
    arch::{self, x86_64::percpu, MAX_CPUS},
    error::{KernelError, KernelResult},
    mm::{AddressSpace, FRAME_ALLOCATOR},
};

/// Per-CPU scheduler state: the ready queue, the running task, tasks
/// awaiting reclamation, and tick-deadline sleepers. One lock covers all
/// of it, per the concurrency model.
pub struct CpuSched {
    runq: RunQueue,
    current: Option<TaskRef>,
    idle: Option<TaskRef>,
    reap: Vec<TaskRef>,
    sleepers: Vec<(u64, TaskRef)>,
}

impl CpuSched {
    const fn new() -> Self {
        Self {
            runq: RunQueue::new(),
            current: None,
            idle: None,
            reap: Vec::new(),
            sleepers: Vec::new(),
        }
    }
}

/// Per-CPU scheduler slots; each protected by its own IRQ-safe spinlock.
static CPUS: [crate::sync::SpinLock<CpuSched>; MAX_CPUS] =
    [const { crate::sync::SpinLock::new(CpuSched::new()) }; MAX_CPUS];

/// All live tasks, under the global allocation lock.
static TASK_TABLE: Mutex<BTreeMap<u64, TaskRef>> = Mutex::new(BTreeMap::new());

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Round-robin cursor for CPU assignment at task creation.
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Interrupt-controller acknowledge hook, installed by the (external)
/// timer driver. Called from the timer path before switching.
static TIMER_ACK: AtomicU64 = AtomicU64::new(0);

pub fn set_timer_ack(hook: fn()) {
    TIMER_ACK.store(hook as usize as u64, Ordering::Release);
}

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        arch::idle_once();
    }
}

/// Create the per-CPU idle tasks. Idle tasks never enter a run queue.
pub fn init(cpu_count: usize) -> KernelResult<()> {
    for cpu in 0..cpu_count.min(MAX_CPUS) {
        ensure_idle(cpu)?;
    }
    log::info!("[SCHED] scheduler ready on {} CPU(s)", cpu_count);
    Ok(())
}

pub(crate) fn ensure_idle(cpu: usize) -> KernelResult<()> {
    let mut cs = CPUS[cpu].lock();
    if cs.idle.is_some() {
        return Ok(());
    }
    let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
    let mut task = Task::new_kernel(id, "idle", cpu, idle_entry, cpu)?;
    task.is_idle = true;
    cs.idle = Some(Arc::new(task));
    Ok(())
}

/// Timer interrupt body: account the tick, wake due sleepers, acknowledge
/// the controller, then run the switch. Called by the trampoline with the
/// interrupted task's frame pointer; returns the frame to resume.
pub extern "C" fn timer_interrupt(saved_rsp: u64) -> u64 {
    let cpu = arch::current_cpu_id();
    let now = percpu::tick(cpu);
    wake_sleepers(cpu, now);

    let ack = TIMER_ACK.load(Ordering::Acquire);
    if ack != 0 {
        // SAFETY: TIMER_ACK only ever holds a `fn()` stored by
        // `set_timer_ack`.
        let ack: fn() = unsafe { core::mem::transmute(ack as usize) };
        ack();
    }

    switch(cpu, saved_rsp)
}

/// Voluntary-yield interrupt body.
pub extern "C" fn yield_interrupt(saved_rsp: u64) -> u64 {
    switch(arch::current_cpu_id(), saved_rsp)
}

/// The scheduler switch.
///
/// 1. take this CPU's queue lock;
/// 2. record the outgoing task's stack pointer;
/// 3. requeue / park / schedule-for-reap the outgoing task by state;
/// 4. pick the next task, falling back to the outgoing task or the idle
///    task when the queue is empty;
/// 5. promote it to RUNNING, publish its stack top for the TSS, load its
///    CR3 if it differs, release the lock, and return its saved RSP.
pub fn switch(cpu: usize, saved_rsp: u64) -> u64 {
    let mut reaped: Vec<TaskRef> = Vec::new();
    let next_rsp;
    {
        let mut cs = CPUS[cpu].lock();
        // Tasks parked by an earlier switch run on stacks nobody uses
        // anymore; reclaim them once the lock is dropped.
        core::mem::swap(&mut reaped, &mut cs.reap);

        let outgoing = cs.current.take();
        if let Some(ref task) = outgoing {
            task.set_saved_rsp(saved_rsp);
            match task.state() {
                TaskState::Running => {
                    task.set_state(TaskState::Ready);
                    if !task.is_idle && !task.mark_queued() {
                        cs.runq.enqueue(task.clone());
                    }
                }
                // A wake raced with our block; `unblock` may have put the
                // task back on the queue already.
                TaskState::Ready => {
                    if !task.is_idle && !task.mark_queued() {
                        cs.runq.enqueue(task.clone());
                    }
                }
                TaskState::Blocked | TaskState::Sleeping => {}
                TaskState::Terminated => {
                    cs.reap.push(task.clone());
                }
                TaskState::Unused => {}
            }
        }

        // Dequeue the next runnable task, discarding corpses the kill
        // path left in the queue.
        let mut next = None;
        while let Some(candidate) = cs.runq.dequeue() {
            candidate.clear_queued();
            if candidate.state() == TaskState::Terminated {
                cs.reap.push(candidate);
                continue;
            }
            next = Some(candidate);
            break;
        }

        let next = match next {
            Some(task) => task,
            None => match outgoing {
                Some(ref task) if task.is_idle && task.state() == TaskState::Ready => {
                    task.clone()
                }
                _ => cs.idle.clone().expect("CPU has no idle task"),
            },
        };

        next.set_state(TaskState::Running);
        arch::set_tss_rsp0(cpu, next.kstack_top());

        let cr3 = next.cr3();
        if cr3 != 0 && cr3 != arch::read_cr3() {
            // SAFETY: `cr3` roots an address space whose kernel half was
            // copied from the boot tables, so kernel code and stacks stay
            // mapped across the write.
            unsafe { arch::load_cr3(cr3) };
        }

        next_rsp = next.saved_rsp();
        cs.current = Some(next);
    }

    // Lock released: reclaim tasks parked by earlier switches. We are
    // guaranteed not to be running on any of their stacks.
    for task in reaped {
        reclaim(task);
    }

    next_rsp
}

/// Free a terminated task's resources: its address space (frames honor
/// their refcounts) and, via the final `Arc` drop, its kernel stack.
fn reclaim(task: TaskRef) {
    if let Some(mut space) = task.addr_space.lock().take() {
        space.destroy(&FRAME_ALLOCATOR);
    }
    task.fds.lock().close_all();
    task.set_state(TaskState::Unused);
    TASK_TABLE.lock().remove(&task.id.0);
    log::debug!("[SCHED] reclaimed task {} ({})", task.id.0, task.name);
}

fn wake_sleepers(cpu: usize, now: u64) {
    let mut cs = CPUS[cpu].lock();
    let sleepers = core::mem::take(&mut cs.sleepers);
    for (deadline, task) in sleepers {
        if deadline <= now {
            if task.cas_state(TaskState::Sleeping, TaskState::Ready).is_ok()
                && !task.mark_queued()
            {
                cs.runq.enqueue(task);
            }
        } else {
            cs.sleepers.push((deadline, task));
        }
    }
}

/// The task currently running on this CPU.
pub fn current_task() -> Option<TaskRef> {
    let cpu = arch::current_cpu_id();
    CPUS[cpu].lock().current.clone()
}

pub fn lookup(id: TaskId) -> Option<TaskRef> {
    TASK_TABLE.lock().get(&id.0).cloned()
}

/// Put a ready task on its home CPU's queue (idempotent: a task already
/// queued stays where it is).
fn enqueue_on(cpu: usize, task: TaskRef) {
    if task.mark_queued() {
        return;
    }
    let ok = CPUS[cpu].lock().runq.enqueue(task);
    if !ok {
        crate::error::fatal("SCHED", "run queue overflow");
    }
}

/// Create a kernel task and make it runnable. The CPU is chosen
/// round-robin at creation and never changes.
pub fn spawn_kernel(
    name: &str,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) -> KernelResult<TaskRef> {
    let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
    let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % percpu::cpu_count();
    let task = Arc::new(Task::new_kernel(id, name, cpu, entry, arg)?);
    TASK_TABLE.lock().insert(id.0, task.clone());
    enqueue_on(cpu, task.clone());
    Ok(task)
}

/// Create a user task from a populated address space and make it
/// runnable.
pub fn spawn_user(
    name: &str,
    space: AddressSpace,
    entry: u64,
    user_stack_top: u64,
    parent: Option<TaskId>,
) -> KernelResult<TaskRef> {
    let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
    let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % percpu::cpu_count();
    let task = Arc::new(Task::new_user(
        id,
        name,
        cpu,
        space,
        entry,
        user_stack_top,
        parent,
    )?);
    TASK_TABLE.lock().insert(id.0, task.clone());
    enqueue_on(cpu, task.clone());
    Ok(task)
}

/// Register an already-built task (fork path, which needs to fix up the
/// child's frame before it becomes runnable).
pub fn adopt(task: Task) -> TaskRef {
    let task = Arc::new(task);
    TASK_TABLE.lock().insert(task.id.0, task.clone());
    enqueue_on(task.cpu, task.clone());
    task
}

/// Allocate a task id and home CPU for a task built outside `spawn_*`.
pub fn allocate_task_slot() -> (TaskId, usize) {
    let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
    let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % percpu::cpu_count();
    (id, cpu)
}

/// Yield the CPU voluntarily; lands in the same switch path as the timer.
pub fn yield_now() {
    arch::x86_64::context::raise_yield();
}

/// Block the current task. On return the caller must recheck its wait
/// condition: wakeups may race, and `unblock` is permitted to be early.
pub fn block() {
    let Some(task) = current_task() else { return };
    // A racing unblock may have already made us Ready; the switch will
    // then re-enqueue us immediately instead of parking.
    let _ = task.cas_state(TaskState::Running, TaskState::Blocked);
    yield_now();
}

/// Make a blocked or sleeping task runnable on its home CPU.
pub fn unblock(task: &TaskRef) {
    if task.cas_state(TaskState::Blocked, TaskState::Ready).is_ok()
        || task.cas_state(TaskState::Sleeping, TaskState::Ready).is_ok()
    {
        enqueue_on(task.cpu, task.clone());
    } else {
        // Not parked yet: flip Running -> Ready so the imminent switch
        // re-enqueues instead of blocking (the missed-wakeup protocol).
        let _ = task.cas_state(TaskState::Running, TaskState::Ready);
    }
}

/// Sleep for at least `ticks` timer periods.
pub fn sleep_ticks(ticks: u64) {
    let Some(task) = current_task() else { return };
    let cpu = task.cpu;
    let deadline = percpu::ticks(cpu) + ticks;
    CPUS[cpu].lock().sleepers.push((deadline, task.clone()));
    let _ = task.cas_state(TaskState::Running, TaskState::Sleeping);
    yield_now();
}

/// Terminate the calling task. The descriptor and stack are reclaimed by
/// a later switch on this CPU; the exit code is published first so a
/// waiting parent observes it.
pub fn exit(code: i64) -> ! {
    if let Some(task) = current_task() {
        task.exit_code.store(code, Ordering::Release);
        task.set_state(TaskState::Terminated);
        task.exited.post();
    }
    loop {
        yield_now();
        arch::idle_once();
    }
}

/// Terminate another task. It is reaped by its home CPU's next switch.
pub fn kill(id: TaskId) -> KernelResult<()> {
    let task = lookup(id).ok_or(KernelError::NotFound)?;
    if task.is_idle {
        return Err(KernelError::Invalid);
    }

    let prior = task.state();
    task.exit_code.store(-1, Ordering::Release);
    task.set_state(TaskState::Terminated);

    match prior {
        TaskState::Blocked | TaskState::Sleeping => {
            // Off every run queue: park it for the reaper directly.
            let mut cs = CPUS[task.cpu].lock();
            cs.sleepers.retain(|(_, t)| t.id != id);
            cs.reap.push(task.clone());
        }
        // Ready tasks are discarded by the dequeue loop; a Running task
        // is handled by its own next switch.
        _ => {}
    }

    task.exited.post();
    Ok(())
}

/// Wait for a task to exit and return its exit code.
pub fn wait_for(id: TaskId) -> KernelResult<i64> {
    let task = lookup(id).ok_or(KernelError::NotFound)?;
    task.exited.wait();
    // Waking consumed the exit permit; leave it for other waiters.
    task.exited.post();
    Ok(task.exit_code.load(Ordering::Acquire))
}

/// Scheduler statistics for one CPU (diagnostics).
pub fn queue_depth(cpu: usize) -> usize {
    CPUS[cpu].lock().runq.len()
}
