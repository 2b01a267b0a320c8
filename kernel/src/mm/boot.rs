//! Boot-time memory description
//!
//! The bootloader hands the kernel a physical memory map and the offset of
//! the higher-half direct map. This module owns the kernel's copy of that
//! information: fixed-capacity (the frame allocator consumes it before the
//! heap exists) and independent of any boot protocol crate.

use super::MemoryRegionKind::Usable;

/// Maximum number of memory regions the kernel tracks.
pub const MAX_REGIONS: usize = 64;

/// Classification of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may allocate from
    Usable,
    /// Firmware, MMIO holes, and other untouchable ranges
    Reserved,
    /// Bootloader structures; reclaimable in principle, never reclaimed here
    Bootloader,
}

/// A physical memory region, `[start, end)` in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Fixed-capacity physical memory map.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    regions: [MemoryRegion; MAX_REGIONS],
    len: usize,
}

impl MemoryMap {
    pub const fn empty() -> Self {
        const NONE: MemoryRegion = MemoryRegion {
            start: 0,
            end: 0,
            kind: MemoryRegionKind::Reserved,
        };
        Self {
            regions: [NONE; MAX_REGIONS],
            len: 0,
        }
    }

    /// Append a region. Regions past [`MAX_REGIONS`] are dropped with a
    /// warning; real firmware maps stay far below the cap.
    pub fn push(&mut self, region: MemoryRegion) {
        if region.is_empty() {
            return;
        }
        if self.len == MAX_REGIONS {
            log::warn!("[MM] memory map full, dropping region {:#x?}", region);
            return;
        }
        self.regions[self.len] = region;
        self.len += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.len].iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.iter().filter(|r| r.kind == Usable)
    }

    /// Highest usable physical address, exclusive.
    pub fn usable_top(&self) -> u64 {
        self.usable().map(|r| r.end).max().unwrap_or(0)
    }

    /// Largest usable region, for carving allocator metadata.
    pub fn largest_usable(&self) -> Option<&MemoryRegion> {
        self.usable().max_by_key(|r| r.len())
    }
}

/// Boot-time configuration consumed by the core.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Offset of the higher-half direct map of all physical RAM
    pub hhdm_offset: u64,
    /// Number of CPUs the bootloader woke (always at least 1)
    pub cpu_count: usize,
}

/// Convert the boot protocol's region list into the kernel's map.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn from_bootloader(info: &bootloader_api::BootInfo) -> (MemoryMap, BootConfig) {
    use bootloader_api::info::MemoryRegionKind as BootKind;

    let mut map = MemoryMap::empty();
    for region in info.memory_regions.iter() {
        let kind = match region.kind {
            BootKind::Usable => MemoryRegionKind::Usable,
            BootKind::Bootloader => MemoryRegionKind::Bootloader,
            _ => MemoryRegionKind::Reserved,
        };
        map.push(MemoryRegion {
            start: region.start,
            end: region.end,
            kind,
        });
    }

    let hhdm_offset = info
        .physical_memory_offset
        .into_option()
        .expect("bootloader must map physical memory");

    (
        map,
        BootConfig {
            hhdm_offset,
            cpu_count: 1,
        },
    )
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn usable_filtering_and_largest() {
        let mut map = MemoryMap::empty();
        map.push(MemoryRegion {
            start: 0,
            end: 0x9F000,
            kind: MemoryRegionKind::Usable,
        });
        map.push(MemoryRegion {
            start: 0x9F000,
            end: 0x100000,
            kind: MemoryRegionKind::Reserved,
        });
        map.push(MemoryRegion {
            start: 0x100000,
            end: 0x1000000,
            kind: MemoryRegionKind::Usable,
        });

        assert_eq!(map.usable().count(), 2);
        assert_eq!(map.usable_top(), 0x1000000);
        let largest = map.largest_usable().unwrap();
        assert_eq!(largest.start, 0x100000);
    }

    #[test]
    fn empty_regions_are_dropped() {
        let mut map = MemoryMap::empty();
        map.push(MemoryRegion {
            start: 0x1000,
            end: 0x1000,
            kind: MemoryRegionKind::Usable,
        });
        assert_eq!(map.iter().count(), 0);
    }
}
