//! Kernel bring-up
//!
//! Ordered initialization from the boot protocol hand-off to the first
//! scheduled task: serial + logging, the boot heap arena, the frame
//! allocator (which consumes the memory map), the real heap, the
//! kernel-half page-table template, per-CPU state, the scheduler, and
//! IPC. The boot context then parks; the first timer interrupt switches
//! onto the task that init spawned.

use bootloader_api::BootInfo;

use crate::{
    arch::{self, x86_64::percpu},
    mm::{self, vas, PhysicalAddress},
    sched::scheduler,
    serial,
};

/// Entry from the boot stub. Never returns; the boot context becomes
/// this CPU's idle-until-first-tick loop.
pub fn start(info: &'static mut BootInfo) -> ! {
    serial::init();
    mm::heap::init_boot_arena();
    log::info!("[BOOT] EmberOS {}", env!("CARGO_PKG_VERSION"));

    let (map, config) = mm::boot::from_bootloader(info);
    if let Err(e) = mm::init(&map, &config) {
        log::error!("[BOOT] memory init failed: {}", e);
        arch::halt();
    }

    // Every address space shares the boot tables' kernel half.
    vas::set_kernel_template(PhysicalAddress::new(arch::read_cr3()));

    percpu::set_cpu_count(config.cpu_count);
    if let Err(e) = scheduler::init(config.cpu_count) {
        log::error!("[BOOT] scheduler init failed: {}", e);
        arch::halt();
    }
    crate::ipc::init();

    // Root filesystem and initial tasks come from the device layer and
    // init service, which live outside the core. With nothing mounted
    // yet this CPU simply waits for its timer.
    log::info!("[BOOT] core services online, entering idle");
    loop {
        arch::idle_once();
    }
}
