//! Program loader contract
//!
//! The ELF loader itself lives outside the core. The core hands it a
//! fresh address space and the executable image; the loader populates
//! the space and reports where execution starts and where the program
//! break begins. `execve` and user task creation consume this contract.

use spin::{Mutex, Once};

use crate::{
    error::{KernelError, KernelResult},
    mm::{pmm::FrameAllocator, AddressSpace},
};

/// What the loader hands back after populating an address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Entry point virtual address
    pub entry: u64,
    /// First address past the loaded segments (initial program break)
    pub brk: u64,
}

/// Implemented by the external ELF loader.
pub trait ProgramLoader: Send + Sync {
    /// Populate `space` from `image` and return the entry point.
    fn load(
        &self,
        space: &mut AddressSpace,
        pmm: &Mutex<FrameAllocator>,
        image: &[u8],
    ) -> KernelResult<LoadedImage>;
}

static LOADER: Once<&'static dyn ProgramLoader> = Once::new();

/// Install the system program loader (called once during bring-up).
pub fn register_loader(loader: &'static dyn ProgramLoader) {
    LOADER.call_once(|| loader);
}

/// The registered loader, if any.
pub fn loader() -> KernelResult<&'static dyn ProgramLoader> {
    LOADER.get().copied().ok_or(KernelError::Invalid)
}
