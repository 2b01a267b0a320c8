//! Per-CPU state
//!
//! One slot per CPU, indexed by the CPU id the bootloader's wake-up
//! mechanism assigns. The TSS RSP0 cell is the hand-off point to the
//! external TSS code: the scheduler writes the incoming task's kernel
//! stack top here on every switch, and the interrupt path reads it back
//! when entering ring 0 from ring 3.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 16;

/// Per-CPU slot
pub struct CpuLocal {
    /// Kernel stack top for ring-3 -> ring-0 transitions (TSS RSP0 mirror)
    pub tss_rsp0: AtomicU64,
    /// Monotonic timer ticks observed on this CPU
    pub ticks: AtomicU64,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            tss_rsp0: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }
}

/// All per-CPU slots
pub static CPU_LOCALS: [CpuLocal; MAX_CPUS] = [const { CpuLocal::new() }; MAX_CPUS];

/// Number of CPUs that have been brought online
static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(1);

/// Record the number of CPUs the bootloader woke.
pub fn set_cpu_count(count: usize) {
    ONLINE_CPUS.store(count.clamp(1, MAX_CPUS), Ordering::Release);
}

pub fn cpu_count() -> usize {
    ONLINE_CPUS.load(Ordering::Acquire)
}

/// Identify the executing CPU.
#[cfg(target_os = "none")]
pub fn current_cpu_id() -> usize {
    // SAFETY: CPUID leaf 1 is available on every x86_64 CPU; reading it
    // has no side effects.
    let apic_id = unsafe {
        let cpuid = core::arch::x86_64::__cpuid(0x1);
        (cpuid.ebx >> 24) & 0xFF
    };
    (apic_id as usize).min(MAX_CPUS - 1)
}

/// On the host there is exactly one "CPU".
#[cfg(not(target_os = "none"))]
pub fn current_cpu_id() -> usize {
    0
}

/// Publish the kernel stack top for `cpu`; the external TSS code copies
/// this into TSS.RSP0.
pub fn set_tss_rsp0(cpu: usize, rsp0: u64) {
    CPU_LOCALS[cpu.min(MAX_CPUS - 1)]
        .tss_rsp0
        .store(rsp0, Ordering::Release);
}

pub fn tss_rsp0(cpu: usize) -> u64 {
    CPU_LOCALS[cpu.min(MAX_CPUS - 1)]
        .tss_rsp0
        .load(Ordering::Acquire)
}

/// Bump and read this CPU's tick counter (timer interrupt path).
pub fn tick(cpu: usize) -> u64 {
    CPU_LOCALS[cpu.min(MAX_CPUS - 1)]
        .ticks
        .fetch_add(1, Ordering::Relaxed)
        + 1
}

pub fn ticks(cpu: usize) -> u64 {
    CPU_LOCALS[cpu.min(MAX_CPUS - 1)]
        .ticks
        .load(Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tss_rsp0_roundtrip() {
        set_tss_rsp0(3, 0xFFFF_8000_1234_0000);
        assert_eq!(tss_rsp0(3), 0xFFFF_8000_1234_0000);
    }

    #[test]
    fn ticks_are_monotonic() {
        let start = ticks(5);
        tick(5);
        tick(5);
        assert_eq!(ticks(5), start + 2);
    }
}
