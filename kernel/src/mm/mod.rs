//! Memory management for EmberOS
//!
//! Owns the physical frame allocator, page-table manipulation, per-process
//! address spaces with copy-on-write, the VMA tracker, and the kernel heap.
//! All physical memory is reachable through the higher-half direct map
//! (HHDM) provided by the bootloader; [`phys_to_virt`] is the only way the
//! kernel turns a physical address into a pointer.

use core::sync::atomic::{AtomicU64, Ordering};

pub mod boot;
pub mod heap;
pub mod page_table;
pub mod pmm;
pub mod vas;
pub mod vma;

pub use boot::{BootConfig, MemoryMap, MemoryRegion, MemoryRegionKind};
pub use pmm::{FrameAllocator, FrameNumber, FRAME_ALLOCATOR};
pub use vas::AddressSpace;
pub use vma::{VmaFlags, VmaKind, VmaSet};

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn offset(&self, off: u64) -> Self {
        Self(self.0 + off)
    }

    /// Page-table indices for the 4 levels, top (PML4) first.
    pub const fn table_indices(&self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1FF) as usize,
            ((self.0 >> 30) & 0x1FF) as usize,
            ((self.0 >> 21) & 0x1FF) as usize,
            ((self.0 >> 12) & 0x1FF) as usize,
        ]
    }
}

bitflags::bitflags! {
    /// Page-table entry flags (x86_64 layout)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// Software bit: frame is shared copy-on-write
        const COW           = 1 << 9;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Offset of the higher-half direct map, set once during bootstrap.
///
/// Zero is a valid value on the host test target, where "physical"
/// addresses already are host pointers into a test arena.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the HHDM offset reported by the bootloader.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address into a kernel-accessible pointer through
/// the higher-half direct map.
pub fn phys_to_virt(pa: PhysicalAddress) -> *mut u8 {
    (pa.as_u64() + HHDM_OFFSET.load(Ordering::Acquire)) as *mut u8
}

/// Initialize memory management from the boot memory map.
///
/// Order matters: the HHDM offset must be in place before the frame
/// allocator carves its metadata out of the map, and the heap can only
/// grow once frames can be allocated.
pub fn init(map: &MemoryMap, config: &BootConfig) -> crate::error::KernelResult<()> {
    set_hhdm_offset(config.hhdm_offset);

    FRAME_ALLOCATOR.lock().init(map)?;
    let stats = FRAME_ALLOCATOR.lock().stats();
    log::info!(
        "[MM] frame allocator ready: {} usable frames, {} reserved",
        stats.free_frames,
        stats.total_frames - stats.free_frames
    );

    heap::init();
    log::info!("[MM] kernel heap online");
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil {
    //! Host-test memory arena.
    //!
    //! Unit tests model physical RAM with a leaked, page-aligned host
    //! buffer. The HHDM offset stays at its default of zero, so
    //! "physical" addresses are real pointers into the arena and
    //! `phys_to_virt` behaves identically on host and target.

    use alloc::vec;
    use alloc::vec::Vec;

    use spin::Mutex;

    use super::boot::{MemoryMap, MemoryRegion, MemoryRegionKind};
    use super::pmm::FrameAllocator;
    use super::FRAME_SIZE;

    pub(crate) fn arena_map(bytes: usize) -> MemoryMap {
        let arena: Vec<u8> = vec![0u8; bytes + FRAME_SIZE];
        let base = Vec::leak(arena).as_mut_ptr() as u64;
        let start = (base + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);

        let mut map = MemoryMap::empty();
        map.push(MemoryRegion {
            start,
            end: start + bytes as u64,
            kind: MemoryRegionKind::Usable,
        });
        map
    }

    pub(crate) fn fresh_pmm(bytes: usize) -> Mutex<FrameAllocator> {
        let map = arena_map(bytes);
        let mut pmm = FrameAllocator::empty();
        pmm.init(&map).expect("init on a usable map should succeed");
        Mutex::new(pmm)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_alignment() {
        let va = VirtualAddress::new(0x401234);
        assert_eq!(va.align_down().as_u64(), 0x401000);
        assert_eq!(va.align_up().as_u64(), 0x402000);
        assert!(va.align_down().is_page_aligned());
    }

    #[test]
    fn table_indices_decompose_canonical_address() {
        let va = VirtualAddress::new(0x0000_7F12_3456_7000);
        let [l4, l3, l2, l1] = va.table_indices();
        let rebuilt =
            ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12);
        assert_eq!(rebuilt, va.align_down().as_u64());
    }
}
