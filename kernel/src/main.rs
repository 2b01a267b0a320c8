//! Bare-metal kernel binary
//!
//! The bootloader maps all physical memory (the HHDM) and calls
//! `kernel_main`; everything else happens in the library crate. On the
//! host target this binary is an empty shell so `cargo test` can build
//! the workspace.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use bootloader_api::{
        config::{BootloaderConfig, Mapping},
        entry_point, BootInfo,
    };

    static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(info: &'static mut BootInfo) -> ! {
        ember_kernel::bootstrap::start(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
