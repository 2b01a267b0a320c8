//! Virtual-memory area tracking
//!
//! Each address space owns a `VmaSet`: the sorted, non-overlapping list of
//! user mappings with their permissions and kind, plus the downward-growing
//! `mmap_base` cursor used to place new anonymous mappings.

use alloc::vec::Vec;

use super::{VirtualAddress, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags::bitflags! {
    /// VMA permission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

/// What backs a virtual-memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    File,
    Stack,
    Heap,
    Device,
}

/// A contiguous user mapping `[start, end)` with uniform flags.
#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

impl Vma {
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start && va.as_u64() < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Lowest address `find_free` will place a mapping at.
const MMAP_FLOOR: u64 = 0x1_0000;

/// Sorted set of virtual-memory areas for one address space.
#[derive(Clone)]
pub struct VmaSet {
    /// Areas strictly sorted by `start`; no two overlap
    areas: Vec<Vma>,
    /// Cursor for downward gap search
    mmap_base: u64,
}

impl VmaSet {
    pub const fn new(mmap_base: u64) -> Self {
        Self {
            areas: Vec::new(),
            mmap_base,
        }
    }

    pub fn mmap_base(&self) -> u64 {
        self.mmap_base
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.iter()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Insert `[start, end)`. Rejects unaligned or inverted ranges and any
    /// overlap with an existing area.
    pub fn insert(
        &mut self,
        start: u64,
        end: u64,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> KernelResult<()> {
        if start >= end
            || start % FRAME_SIZE as u64 != 0
            || end % FRAME_SIZE as u64 != 0
        {
            return Err(KernelError::Invalid);
        }
        let pos = self.areas.partition_point(|a| a.start < start);
        if let Some(prev) = pos.checked_sub(1).and_then(|i| self.areas.get(i)) {
            if prev.end > start {
                return Err(KernelError::AlreadyExists);
            }
        }
        if let Some(next) = self.areas.get(pos) {
            if next.start < end {
                return Err(KernelError::AlreadyExists);
            }
        }
        self.areas.insert(
            pos,
            Vma {
                start,
                end,
                flags,
                kind,
            },
        );
        Ok(())
    }

    /// Area containing `va`, if any.
    pub fn find(&self, va: VirtualAddress) -> Option<&Vma> {
        let pos = self.areas.partition_point(|a| a.start <= va.as_u64());
        pos.checked_sub(1)
            .map(|i| &self.areas[i])
            .filter(|a| a.contains(va))
    }

    /// Remove `[start, end)` from the set.
    ///
    /// Handles every overlap shape: areas fully inside the range are
    /// deleted, partial overlaps are truncated, and an area spanning the
    /// whole range is split in two.
    pub fn remove(&mut self, start: u64, end: u64) -> KernelResult<()> {
        if start >= end {
            return Err(KernelError::Invalid);
        }
        let mut result: Vec<Vma> = Vec::with_capacity(self.areas.len() + 1);
        for area in self.areas.drain(..) {
            if area.end <= start || area.start >= end {
                // No overlap
                result.push(area);
            } else if start <= area.start && end >= area.end {
                // Full containment: drop
            } else if start <= area.start {
                // Left partial: cut the head
                result.push(Vma {
                    start: end,
                    ..area
                });
            } else if end >= area.end {
                // Right partial: cut the tail
                result.push(Vma {
                    end: start,
                    ..area
                });
            } else {
                // Range strictly inside: split
                result.push(Vma {
                    end: start,
                    ..area
                });
                result.push(Vma {
                    start: end,
                    ..area
                });
            }
        }
        self.areas = result;
        Ok(())
    }

    /// Find a free, page-aligned gap of `size` bytes below `mmap_base`,
    /// moving the cursor down past the returned range.
    pub fn find_free(&mut self, size: u64) -> Option<VirtualAddress> {
        let size = size.div_ceil(FRAME_SIZE as u64) * FRAME_SIZE as u64;
        if size == 0 {
            return None;
        }

        let mut base = self.mmap_base.checked_sub(size)?;
        loop {
            if base < MMAP_FLOOR {
                return None;
            }
            // Highest area that starts below the candidate's end
            match self
                .areas
                .iter()
                .rev()
                .find(|a| a.start < base + size && a.end > base)
            {
                Some(blocker) => {
                    base = blocker.start.checked_sub(size)?;
                }
                None => {
                    self.mmap_base = base;
                    return Some(VirtualAddress::new(base));
                }
            }
        }
    }

    /// Debug check: strictly sorted, no overlaps.
    pub fn is_well_formed(&self) -> bool {
        self.areas
            .windows(2)
            .all(|w| w[0].start < w[0].end && w[0].end <= w[1].start)
            && self.areas.iter().all(|a| a.start < a.end)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const P: u64 = FRAME_SIZE as u64;

    fn set_with(ranges: &[(u64, u64)]) -> VmaSet {
        let mut set = VmaSet::new(0x7000_0000_0000);
        for &(s, e) in ranges {
            set.insert(s, e, VmaFlags::READ | VmaFlags::USER, VmaKind::Anonymous)
                .unwrap();
        }
        set
    }

    #[test]
    fn insert_keeps_sorted_and_rejects_overlap() {
        let mut set = set_with(&[(4 * P, 6 * P), (P, 2 * P), (8 * P, 9 * P)]);
        assert!(set.is_well_formed());
        assert_eq!(
            set.insert(5 * P, 7 * P, VmaFlags::READ, VmaKind::Anonymous),
            Err(KernelError::AlreadyExists)
        );
        assert_eq!(
            set.insert(3 * P + 5, 4 * P, VmaFlags::READ, VmaKind::Anonymous),
            Err(KernelError::Invalid)
        );
        assert!(set.is_well_formed());
    }

    #[test]
    fn find_hits_containing_area_only() {
        let set = set_with(&[(P, 3 * P)]);
        assert!(set.find(VirtualAddress::new(P)).is_some());
        assert!(set.find(VirtualAddress::new(2 * P + 123)).is_some());
        assert!(set.find(VirtualAddress::new(3 * P)).is_none());
        assert!(set.find(VirtualAddress::new(0)).is_none());
    }

    #[test]
    fn remove_no_overlap_keeps_everything() {
        let mut set = set_with(&[(P, 2 * P), (4 * P, 5 * P)]);
        set.remove(2 * P, 4 * P).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.is_well_formed());
    }

    #[test]
    fn remove_full_containment_deletes() {
        let mut set = set_with(&[(2 * P, 4 * P)]);
        set.remove(P, 5 * P).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn remove_left_partial_truncates_head() {
        let mut set = set_with(&[(2 * P, 6 * P)]);
        set.remove(P, 4 * P).unwrap();
        assert_eq!(set.len(), 1);
        let a = set.iter().next().unwrap();
        assert_eq!((a.start, a.end), (4 * P, 6 * P));
    }

    #[test]
    fn remove_right_partial_truncates_tail() {
        let mut set = set_with(&[(2 * P, 6 * P)]);
        set.remove(4 * P, 8 * P).unwrap();
        let a = set.iter().next().unwrap();
        assert_eq!((a.start, a.end), (2 * P, 4 * P));
    }

    #[test]
    fn remove_spanning_splits_in_two() {
        let mut set = set_with(&[(2 * P, 8 * P)]);
        set.remove(4 * P, 5 * P).unwrap();
        assert_eq!(set.len(), 2);
        let areas: alloc::vec::Vec<_> = set.iter().collect();
        assert_eq!((areas[0].start, areas[0].end), (2 * P, 4 * P));
        assert_eq!((areas[1].start, areas[1].end), (5 * P, 8 * P));
        assert!(set.is_well_formed());
    }

    #[test]
    fn find_free_walks_down_and_moves_cursor() {
        let mut set = VmaSet::new(0x7000_0000_0000);
        let first = set.find_free(3 * P).unwrap();
        assert_eq!(first.as_u64(), 0x7000_0000_0000 - 3 * P);
        assert!(first.is_page_aligned());

        let second = set.find_free(P).unwrap();
        assert_eq!(second.as_u64(), first.as_u64() - P);
        assert_eq!(set.mmap_base(), second.as_u64());
    }

    #[test]
    fn find_free_skips_existing_areas() {
        let top = 0x7000_0000_0000;
        let mut set = VmaSet::new(top);
        set.insert(top - 4 * P, top - P, VmaFlags::READ, VmaKind::Anonymous)
            .unwrap();
        // The 1-page gap right below the cursor fits a 1-page request...
        let one = set.find_free(P).unwrap();
        assert_eq!(one.as_u64(), top - P);
        // ...but the next request must jump below the existing area.
        let two = set.find_free(2 * P).unwrap();
        assert_eq!(two.as_u64(), top - 6 * P);
    }

    #[test]
    fn unaligned_size_is_rounded_up() {
        let mut set = VmaSet::new(0x1_0000_0000);
        let got = set.find_free(P + 1).unwrap();
        assert_eq!(got.as_u64(), 0x1_0000_0000 - 2 * P);
    }
}
