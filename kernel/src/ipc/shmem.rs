//! Anonymous shared-memory regions
//!
//! A region owns `ceil(size/4096)` frames (not necessarily contiguous)
//! through one strong reference each. Mapping a region into an address
//! space installs user PTEs and takes another reference per frame;
//! unmapping drops them. The region itself dies when the last mapping
//! and the creator's reference are both gone.

use alloc::{collections::BTreeMap, vec::Vec};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        pmm::{FrameAllocator, FrameNumber},
        vas::alloc_user_frame,
        AddressSpace, PageFlags, VirtualAddress, VmaFlags, VmaKind, FRAME_SIZE,
    },
};

/// One mapping of a region into an address space.
#[derive(Debug, Clone, Copy)]
struct ShmMapping {
    asid: u64,
    base: u64,
}

struct ShmRegion {
    size: usize,
    frames: Vec<FrameNumber>,
    mappings: Vec<ShmMapping>,
    /// The creator's reference; dropped by `release`.
    creator_ref: bool,
}

struct ShmTableInner {
    regions: BTreeMap<u32, ShmRegion>,
    next_id: u32,
}

/// The system-wide shared-memory table.
pub struct ShmTable {
    inner: Mutex<ShmTableInner>,
}

/// Global instance used by the syscall layer.
pub static SHM_TABLE: ShmTable = ShmTable::new();

impl ShmTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ShmTableInner {
                regions: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Allocate a region of at least `size` bytes. The frames hold one
    /// strong reference each until the region is destroyed.
    pub fn create(&self, size: usize, pmm: &Mutex<FrameAllocator>) -> KernelResult<u32> {
        if size == 0 {
            return Err(KernelError::Invalid);
        }
        let count = size.div_ceil(FRAME_SIZE);
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            match alloc_user_frame(pmm) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in frames {
                        pmm.lock().free_frame(frame);
                    }
                    return Err(e);
                }
            }
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.regions.insert(
            id,
            ShmRegion {
                size: count * FRAME_SIZE,
                frames,
                mappings: Vec::new(),
                creator_ref: true,
            },
        );
        Ok(id)
    }

    /// Map a region into `space`. Each frame gains a reference; the
    /// chosen base comes from the space's downward gap search.
    pub fn map(
        &self,
        id: u32,
        space: &mut AddressSpace,
        pmm: &Mutex<FrameAllocator>,
    ) -> KernelResult<VirtualAddress> {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(KernelError::NotFound)?;
        let asid = space.id();
        if region.mappings.iter().any(|m| m.asid == asid) {
            return Err(KernelError::AlreadyExists);
        }

        let base = space
            .vmas
            .lock()
            .find_free(region.size as u64)
            .ok_or(KernelError::OutOfMemory)?;
        space.vmas.lock().insert(
            base.as_u64(),
            base.as_u64() + region.size as u64,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
            VmaKind::Anonymous,
        )?;

        for (i, frame) in region.frames.iter().enumerate() {
            pmm.lock().incref(*frame);
            space.map(
                pmm,
                base.offset((i * FRAME_SIZE) as u64),
                frame.addr(),
                PageFlags::WRITABLE | PageFlags::USER,
            )?;
        }

        region.mappings.push(ShmMapping {
            asid,
            base: base.as_u64(),
        });
        Ok(base)
    }

    /// Tear down this space's mapping of the region, dropping one frame
    /// reference per page.
    pub fn unmap(
        &self,
        id: u32,
        space: &mut AddressSpace,
        pmm: &Mutex<FrameAllocator>,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(KernelError::NotFound)?;
        let asid = space.id();
        let pos = region
            .mappings
            .iter()
            .position(|m| m.asid == asid)
            .ok_or(KernelError::NotFound)?;
        let mapping = region.mappings.remove(pos);

        for i in 0..region.frames.len() {
            let va = VirtualAddress::new(mapping.base + (i * FRAME_SIZE) as u64);
            space.unmap(pmm, va, true)?;
        }
        space
            .vmas
            .lock()
            .remove(mapping.base, mapping.base + region.size as u64)?;

        Self::maybe_destroy(&mut inner, id, pmm);
        Ok(())
    }

    /// Drop the creator's reference (creator exit or explicit destroy).
    pub fn release(&self, id: u32, pmm: &Mutex<FrameAllocator>) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(KernelError::NotFound)?;
        region.creator_ref = false;
        Self::maybe_destroy(&mut inner, id, pmm);
        Ok(())
    }

    fn maybe_destroy(inner: &mut ShmTableInner, id: u32, pmm: &Mutex<FrameAllocator>) {
        let dead = inner
            .regions
            .get(&id)
            .is_some_and(|r| !r.creator_ref && r.mappings.is_empty());
        if dead {
            let region = inner.regions.remove(&id).expect("checked above");
            let mut pmm = pmm.lock();
            for frame in region.frames {
                pmm.decref(frame);
            }
        }
    }

    pub fn region_size(&self, id: u32) -> KernelResult<usize> {
        self.inner
            .lock()
            .regions
            .get(&id)
            .map(|r| r.size)
            .ok_or(KernelError::NotFound)
    }
}

impl Default for ShmTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{phys_to_virt, testutil::fresh_pmm};

    #[test]
    fn create_map_unmap_release_lifecycle() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let table = ShmTable::new();
        let baseline = pmm.lock().stats().free_frames;

        let id = table.create(6000, &pmm).unwrap();
        // 6000 bytes round up to two frames.
        assert_eq!(table.region_size(id).unwrap(), 2 * FRAME_SIZE);

        let mut space = AddressSpace::new(&pmm).unwrap();
        let base = table.map(id, &mut space, &pmm).unwrap();
        assert!(base.is_page_aligned());

        // Mapped pages resolve and share the region's frames (refcount 2:
        // region + mapping).
        let pa = space.translate(base).unwrap();
        assert_eq!(pmm.lock().refcount(pa.frame()), 2);

        table.unmap(id, &mut space, &pmm).unwrap();
        assert!(space.translate(base).is_none());
        assert_eq!(pmm.lock().refcount(pa.frame()), 1);

        // Dropping the creator reference destroys the region.
        table.release(id, &pmm).unwrap();
        assert_eq!(table.region_size(id).unwrap_err(), KernelError::NotFound);

        space.destroy(&pmm);
        assert_eq!(pmm.lock().stats().free_frames, baseline);
    }

    #[test]
    fn two_spaces_share_the_same_memory() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let table = ShmTable::new();
        let id = table.create(FRAME_SIZE, &pmm).unwrap();

        let mut a = AddressSpace::new(&pmm).unwrap();
        let mut b = AddressSpace::new(&pmm).unwrap();
        let base_a = table.map(id, &mut a, &pmm).unwrap();
        let base_b = table.map(id, &mut b, &pmm).unwrap();

        // Write through A's mapping, observe through B's.
        let pa_a = a.translate(base_a).unwrap();
        let pa_b = b.translate(base_b).unwrap();
        assert_eq!(pa_a, pa_b);
        // SAFETY: the frame lives in the test arena.
        unsafe { *phys_to_virt(pa_a) = 0x77 };
        // SAFETY: same frame through the other mapping.
        assert_eq!(unsafe { *phys_to_virt(pa_b) }, 0x77);
        assert_eq!(pmm.lock().refcount(pa_a.frame()), 3);

        table.unmap(id, &mut a, &pmm).unwrap();
        table.unmap(id, &mut b, &pmm).unwrap();
        table.release(id, &pmm).unwrap();
        a.destroy(&pmm);
        b.destroy(&pmm);
    }

    #[test]
    fn double_map_from_one_space_is_refused() {
        let pmm = fresh_pmm(4 * 1024 * 1024);
        let table = ShmTable::new();
        let id = table.create(FRAME_SIZE, &pmm).unwrap();
        let mut space = AddressSpace::new(&pmm).unwrap();
        table.map(id, &mut space, &pmm).unwrap();
        assert_eq!(
            table.map(id, &mut space, &pmm).unwrap_err(),
            KernelError::AlreadyExists
        );
        table.unmap(id, &mut space, &pmm).unwrap();
        table.release(id, &pmm).unwrap();
        space.destroy(&pmm);
    }

    #[test]
    fn failed_creation_releases_partial_frames() {
        // A tiny arena: region larger than available frames must fail
        // without leaking what it grabbed first.
        let pmm = fresh_pmm(64 * 1024);
        let table = ShmTable::new();
        let baseline = pmm.lock().stats().free_frames;
        assert!(table.create(1024 * 1024, &pmm).is_err());
        assert_eq!(pmm.lock().stats().free_frames, baseline);
    }
}
