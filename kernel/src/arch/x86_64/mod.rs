//! x86_64 architecture glue
//!
//! Thin wrappers over the `x86_64` crate plus the per-CPU slots and the
//! saved-register frame. CPU bring-up (GDT/IDT/TSS/APIC programming) is an
//! external collaborator; this module only provides what the core itself
//! touches on a switch: CR3, the TLB, RFLAGS.IF, and the TSS RSP0 cell the
//! external TSS code mirrors.

pub mod context;
pub mod percpu;

pub use percpu::current_cpu_id;

/// Halt this CPU forever.
#[cfg(target_os = "none")]
pub fn halt() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Halt with interrupts enabled until the next interrupt (idle loop body).
#[cfg(target_os = "none")]
pub fn idle_once() {
    x86_64::instructions::interrupts::enable_and_hlt();
}

#[cfg(target_os = "none")]
pub fn tlb_flush(va: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
}

#[cfg(target_os = "none")]
pub fn tlb_flush_all() {
    x86_64::instructions::tlb::flush_all();
}

#[cfg(target_os = "none")]
pub fn interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

/// Disable interrupts, returning whether they were enabled.
#[cfg(target_os = "none")]
pub fn save_and_disable_interrupts() -> bool {
    let was = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    was
}

#[cfg(target_os = "none")]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        x86_64::instructions::interrupts::enable();
    }
}

/// Current CR3 value (physical address of the live PML4).
#[cfg(target_os = "none")]
pub fn read_cr3() -> u64 {
    x86_64::registers::control::Cr3::read()
        .0
        .start_address()
        .as_u64()
}

/// Switch to another page-table root.
///
/// # Safety
///
/// `cr3` must be the frame-aligned physical address of a valid PML4 whose
/// kernel half maps the currently executing code and stack.
#[cfg(target_os = "none")]
pub unsafe fn load_cr3(cr3: u64) {
    use x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    };
    let frame = PhysFrame::containing_address(PhysAddr::new(cr3));
    // SAFETY: caller guarantees `cr3` roots a hierarchy that keeps kernel
    // code and stacks mapped.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
