//! EmberOS kernel library
//!
//! The core kernel services: physical frame allocation with per-frame
//! refcounts, copy-on-write address spaces, a per-CPU preemptive
//! scheduler, an LRU block cache, ext2, and port/shared-memory IPC.
//! Exported as a library so the hardware-independent subsystems run
//! under the host test harness as well as on bare metal.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target: link std and use the system allocator so unit tests can
// allocate normally while the kernel heap is exercised explicitly.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod bootstrap;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod mm;
pub mod sched;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod test_framework;

pub use error::{KernelError, KernelResult};

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt()
}

#[cfg(all(target_os = "none", test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
