//! Bare-metal test plumbing
//!
//! Host unit tests use the standard harness; this module only serves the
//! QEMU integration build, reporting results over the isa-debug-exit
//! device.

/// Exit codes understood by the QEMU isa-debug-exit device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Terminate the emulator with the given code.
#[cfg(target_os = "none")]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    // SAFETY: port 0xF4 is the isa-debug-exit device configured by the
    // test runner; writing it terminates the VM.
    unsafe {
        let mut port = Port::new(0xF4);
        port.write(exit_code as u32);
    }
    crate::arch::halt()
}

/// A runnable bare-metal test case.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::println!("[ok]");
    }
}

/// Custom test runner for the bare-metal harness.
#[cfg(target_os = "none")]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    crate::println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success)
}

/// Panic handler body for the bare-metal test harness.
#[cfg(target_os = "none")]
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    crate::println!("[failed]");
    crate::println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
