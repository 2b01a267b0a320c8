//! Architecture support
//!
//! The core consumes a narrow architecture surface: halting, interrupt
//! masking, TLB maintenance, CR3 switching, per-CPU identity, and the
//! saved-register frame layout. On the host test target every operation
//! that would execute a privileged instruction is a stub, so the
//! hardware-independent subsystems run under the standard test harness.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{
    context::{InterruptFrame, KERNEL_CS, KERNEL_DS, USER_CS, USER_DS},
    current_cpu_id,
    percpu::{set_tss_rsp0, MAX_CPUS},
};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::{
    halt, idle_once, interrupts_enabled, load_cr3, read_cr3, restore_interrupts,
    save_and_disable_interrupts, tlb_flush, tlb_flush_all,
};

/// Host (test) implementations: no privileged instructions.
#[cfg(not(target_os = "none"))]
mod host {
    pub fn halt() -> ! {
        panic!("cpu halt requested on host");
    }

    pub fn idle_once() {
        core::hint::spin_loop();
    }

    pub fn tlb_flush(_va: u64) {}

    pub fn tlb_flush_all() {}

    pub fn interrupts_enabled() -> bool {
        false
    }

    pub fn save_and_disable_interrupts() -> bool {
        false
    }

    pub fn restore_interrupts(_was_enabled: bool) {}

    pub fn read_cr3() -> u64 {
        0
    }

    /// # Safety
    ///
    /// Never executed on the host; exists so callers compile unchanged.
    pub unsafe fn load_cr3(_cr3: u64) {}
}

#[cfg(not(target_os = "none"))]
pub use host::*;
