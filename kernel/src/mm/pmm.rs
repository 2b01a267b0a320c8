//! Physical frame allocator
//!
//! Owns the in-use bitmap and the per-frame reference counts. Both arrays
//! live in frames carved out of the memory map itself during `init` and
//! reached through the HHDM; the allocator never touches the kernel heap.
//!
//! Invariant: a frame's refcount is non-zero exactly when its bitmap bit
//! is set. `alloc_frame` establishes refcount 1; sharing (COW, shared
//! memory) goes through `incref`/`decref`; `decref` frees at zero.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{boot::MemoryMap, phys_to_virt, PhysicalAddress, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

/// Physical frame number (physical address / 4096)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy)]
pub struct FrameAllocatorStats {
    pub total_frames: u64,
    pub free_frames: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// Bitmap + refcount frame allocator.
///
/// Construct with [`FrameAllocator::empty`] (const, for the global static)
/// and bring up with [`FrameAllocator::init`].
pub struct FrameAllocator {
    /// In-use bitmap, one bit per tracked frame (set = in use)
    bitmap: Option<&'static mut [u64]>,
    /// Per-frame reference counts, parallel to the bitmap
    refcounts: Option<&'static mut [u16]>,
    /// First tracked frame number
    base_frame: u64,
    /// Number of tracked frames
    nframes: u64,
    /// Free frame count
    free_frames: u64,
    /// Next index to try; advanced past the last allocation, pulled back
    /// on free so a just-freed frame is found first
    hint: u64,
    allocations: u64,
    frees: u64,
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

impl FrameAllocator {
    pub const fn empty() -> Self {
        Self {
            bitmap: None,
            refcounts: None,
            base_frame: 0,
            nframes: 0,
            free_frames: 0,
            hint: 0,
            allocations: 0,
            frees: 0,
        }
    }

    /// Initialize from the boot memory map.
    ///
    /// Reserves the bitmap and refcount array at the start of the largest
    /// usable region and marks those frames in use. Fails with
    /// `MemoryMapUnusable` when no region can hold the metadata.
    pub fn init(&mut self, map: &MemoryMap) -> KernelResult<()> {
        let base = map
            .usable()
            .map(|r| r.start / FRAME_SIZE as u64)
            .min()
            .ok_or(KernelError::MemoryMapUnusable)?;
        let top = map.usable_top() / FRAME_SIZE as u64;
        if top <= base {
            return Err(KernelError::MemoryMapUnusable);
        }
        let nframes = top - base;

        let bitmap_bytes = nframes.div_ceil(64) * 8;
        let refcount_bytes = nframes * 2;
        let meta_bytes = bitmap_bytes + refcount_bytes;
        let meta_frames = meta_bytes.div_ceil(FRAME_SIZE as u64);

        let host = map
            .largest_usable()
            .filter(|r| {
                let start = align_up_frame(r.start);
                start + meta_frames * FRAME_SIZE as u64 <= r.end
            })
            .ok_or(KernelError::MemoryMapUnusable)?;
        let meta_pa = align_up_frame(host.start);

        // SAFETY: meta_pa..meta_pa+meta_bytes lies inside a usable RAM
        // region reported by the bootloader and is reachable through the
        // HHDM. Nothing else references this range: the allocator claims
        // it here, before any frame has been handed out.
        let (bitmap, refcounts) = unsafe {
            let bitmap_ptr = phys_to_virt(PhysicalAddress::new(meta_pa)) as *mut u64;
            let refcount_ptr =
                phys_to_virt(PhysicalAddress::new(meta_pa + bitmap_bytes)) as *mut u16;
            let bitmap = core::slice::from_raw_parts_mut(bitmap_ptr, (bitmap_bytes / 8) as usize);
            let refcounts = core::slice::from_raw_parts_mut(refcount_ptr, nframes as usize);
            (bitmap, refcounts)
        };

        // Everything starts reserved; usable regions are then released,
        // and the metadata frames are claimed back.
        bitmap.fill(u64::MAX);
        refcounts.fill(1);

        self.bitmap = Some(bitmap);
        self.refcounts = Some(refcounts);
        self.base_frame = base;
        self.nframes = nframes;
        self.free_frames = 0;

        for region in map.usable() {
            let first = align_up_frame(region.start) / FRAME_SIZE as u64;
            let last = region.end / FRAME_SIZE as u64;
            for frame in first..last {
                self.release_index(frame - base);
            }
        }

        let meta_first = meta_pa / FRAME_SIZE as u64;
        for frame in meta_first..meta_first + meta_frames {
            self.claim_index(frame - base);
        }

        // Frame 0 backs the null page; never hand it out.
        if base == 0 {
            self.claim_index(0);
        }

        self.hint = 0;
        Ok(())
    }

    /// Allocate one frame. The returned frame has refcount 1.
    pub fn alloc_frame(&mut self) -> KernelResult<FrameNumber> {
        let idx = self.find_free_from(self.hint).or_else(|| {
            // Wrap exactly once before giving up.
            self.find_free_range(0, self.hint)
        });
        match idx {
            Some(idx) => {
                self.claim_index(idx);
                self.hint = idx + 1;
                self.allocations += 1;
                Ok(FrameNumber::new(self.base_frame + idx))
            }
            None => Err(KernelError::OutOfMemory),
        }
    }

    /// Allocate `count` physically contiguous frames, each with refcount 1.
    ///
    /// The search slides a window upward and restarts it past any in-use
    /// bit; a run that cannot be found anywhere yields `OutOfFrames`.
    pub fn alloc_frames(&mut self, count: u64) -> KernelResult<FrameNumber> {
        if count == 0 {
            return Err(KernelError::Invalid);
        }
        if count == 1 {
            return self.alloc_frame();
        }

        let mut start = 0u64;
        while start + count <= self.nframes {
            match (start..start + count).find(|&i| self.is_set(i)) {
                None => {
                    for i in start..start + count {
                        self.claim_index(i);
                    }
                    self.hint = start + count;
                    self.allocations += count;
                    return Ok(FrameNumber::new(self.base_frame + start));
                }
                Some(busy) => start = busy + 1,
            }
        }
        Err(KernelError::OutOfFrames)
    }

    /// Release a frame outright.
    ///
    /// A no-op on frame 0 (null-pointer guard) and on frames outside the
    /// tracked range. Double frees are logged and ignored.
    pub fn free_frame(&mut self, frame: FrameNumber) {
        if frame.as_u64() == 0 {
            return;
        }
        let Some(idx) = self.index_of(frame) else {
            log::warn!("[PMM] free of untracked frame {:#x}", frame.as_u64());
            return;
        };
        if !self.is_set(idx) {
            log::warn!("[PMM] double free of frame {:#x}", frame.as_u64());
            return;
        }
        if self.refcount_at(idx) > 1 {
            log::warn!(
                "[PMM] freeing frame {:#x} with refcount {}",
                frame.as_u64(),
                self.refcount_at(idx)
            );
        }
        self.release_index(idx);
        self.frees += 1;
    }

    /// Add a reference to a live frame.
    pub fn incref(&mut self, frame: FrameNumber) {
        let Some(idx) = self.index_of(frame) else {
            return;
        };
        if !self.is_set(idx) {
            log::warn!("[PMM] incref of free frame {:#x}", frame.as_u64());
            return;
        }
        let rc = &mut self.refcounts.as_mut().unwrap()[idx as usize];
        *rc = rc.checked_add(1).unwrap_or_else(|| {
            log::error!("[PMM] refcount overflow on frame {:#x}", frame.as_u64());
            u16::MAX
        });
    }

    /// Drop a reference; the frame is freed when the count reaches zero.
    pub fn decref(&mut self, frame: FrameNumber) {
        if frame.as_u64() == 0 {
            return;
        }
        let Some(idx) = self.index_of(frame) else {
            return;
        };
        if !self.is_set(idx) {
            log::warn!("[PMM] decref of free frame {:#x}", frame.as_u64());
            return;
        }
        let rc = &mut self.refcounts.as_mut().unwrap()[idx as usize];
        *rc -= 1;
        if *rc == 0 {
            let word = idx / 64;
            self.bitmap.as_mut().unwrap()[word as usize] &= !(1 << (idx % 64));
            self.free_frames += 1;
            self.frees += 1;
            if idx < self.hint {
                self.hint = idx;
            }
        }
    }

    /// Current reference count of a frame (0 = free).
    pub fn refcount(&self, frame: FrameNumber) -> u16 {
        match self.index_of(frame) {
            Some(idx) => self.refcount_at(idx),
            None => 0,
        }
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        FrameAllocatorStats {
            total_frames: self.nframes,
            free_frames: self.free_frames,
            allocations: self.allocations,
            frees: self.frees,
        }
    }

    fn index_of(&self, frame: FrameNumber) -> Option<u64> {
        let n = frame.as_u64();
        if n < self.base_frame || n >= self.base_frame + self.nframes {
            return None;
        }
        Some(n - self.base_frame)
    }

    fn is_set(&self, idx: u64) -> bool {
        let bitmap = self.bitmap.as_ref().expect("frame allocator not initialized");
        bitmap[(idx / 64) as usize] & (1 << (idx % 64)) != 0
    }

    fn refcount_at(&self, idx: u64) -> u16 {
        self.refcounts.as_ref().expect("frame allocator not initialized")[idx as usize]
    }

    /// Mark `idx` in use with refcount 1.
    fn claim_index(&mut self, idx: u64) {
        if !self.is_set(idx) {
            self.free_frames -= 1;
        }
        self.bitmap.as_mut().unwrap()[(idx / 64) as usize] |= 1 << (idx % 64);
        self.refcounts.as_mut().unwrap()[idx as usize] = 1;
    }

    /// Mark `idx` free with refcount 0.
    fn release_index(&mut self, idx: u64) {
        if self.is_set(idx) {
            self.free_frames += 1;
        }
        self.bitmap.as_mut().unwrap()[(idx / 64) as usize] &= !(1 << (idx % 64));
        self.refcounts.as_mut().unwrap()[idx as usize] = 0;
        if idx < self.hint {
            self.hint = idx;
        }
    }

    fn find_free_from(&self, start: u64) -> Option<u64> {
        self.find_free_range(start, self.nframes)
    }

    /// First clear bit in `[start, end)`, skipping fully-set words.
    fn find_free_range(&self, start: u64, end: u64) -> Option<u64> {
        let bitmap = self.bitmap.as_ref()?;
        let mut idx = start;
        while idx < end {
            let word = bitmap[(idx / 64) as usize];
            if word == u64::MAX {
                idx = (idx / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (idx % 64)) == 0 {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }
}

/// Monotonic count of frames ever handed out, for diagnostics.
pub static TOTAL_FRAME_ALLOCS: AtomicU64 = AtomicU64::new(0);

/// Allocate a frame from the global allocator.
pub fn alloc_frame() -> KernelResult<FrameNumber> {
    let frame = FRAME_ALLOCATOR.lock().alloc_frame()?;
    TOTAL_FRAME_ALLOCS.fetch_add(1, Ordering::Relaxed);
    Ok(frame)
}

/// Free a frame through the global allocator.
pub fn free_frame(frame: FrameNumber) {
    FRAME_ALLOCATOR.lock().free_frame(frame);
}

const fn align_up_frame(addr: u64) -> u64 {
    (addr + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::mm::testutil::arena_map;

    fn fresh(bytes: usize) -> FrameAllocator {
        let map = arena_map(bytes);
        let mut pmm = FrameAllocator::empty();
        pmm.init(&map).expect("init on a usable map should succeed");
        pmm
    }

    #[test]
    fn round_trip_single_region() {
        // Single 16 MiB usable region.
        let mut pmm = fresh(16 * 1024 * 1024);

        let mut frames = Vec::new();
        for _ in 0..10 {
            let f = pmm.alloc_frame().expect("allocation from fresh allocator");
            assert!(f.addr().is_frame_aligned());
            assert_eq!(pmm.refcount(f), 1);
            frames.push(f);
        }
        for (i, f) in frames.iter().enumerate() {
            for other in &frames[i + 1..] {
                assert_ne!(f, other);
            }
        }

        let a5 = frames[5];
        pmm.free_frame(a5);
        assert_eq!(pmm.refcount(a5), 0);

        // The hint falls back on free, so the freed frame is reused next.
        let again = pmm.alloc_frame().expect("reallocation after free");
        assert_eq!(again, a5);
        assert_eq!(pmm.refcount(again), 1);
    }

    #[test]
    fn allocated_equals_bitmap_equals_refcounts() {
        let mut pmm = fresh(4 * 1024 * 1024);
        let before = pmm.stats().free_frames;

        let mut live = Vec::new();
        for i in 0..100 {
            live.push(pmm.alloc_frame().unwrap());
            if i % 3 == 0 {
                pmm.free_frame(live.remove(0));
            }
        }

        let stats = pmm.stats();
        assert_eq!(before - stats.free_frames, live.len() as u64);

        let set_bits: u64 = (0..pmm.nframes).filter(|&i| pmm.is_set(i)).count() as u64;
        let refcounted: u64 = (0..pmm.nframes).filter(|&i| pmm.refcount_at(i) > 0).count() as u64;
        assert_eq!(set_bits, refcounted);
        assert_eq!(stats.total_frames - stats.free_frames, set_bits);
    }

    #[test]
    fn refcounted_sharing() {
        let mut pmm = fresh(1024 * 1024);
        let f = pmm.alloc_frame().unwrap();

        pmm.incref(f);
        assert_eq!(pmm.refcount(f), 2);

        pmm.decref(f);
        assert_eq!(pmm.refcount(f), 1);
        // Still allocated: a fresh allocation must not return it.
        let g = pmm.alloc_frame().unwrap();
        assert_ne!(f, g);

        pmm.decref(f);
        assert_eq!(pmm.refcount(f), 0);
    }

    #[test]
    fn contiguous_allocation_is_contiguous() {
        let mut pmm = fresh(4 * 1024 * 1024);
        // Fragment the low frames.
        let a = pmm.alloc_frame().unwrap();
        let b = pmm.alloc_frame().unwrap();
        let _c = pmm.alloc_frame().unwrap();
        pmm.free_frame(b);

        let run = pmm.alloc_frames(8).expect("contiguous run");
        for i in 0..8 {
            assert_eq!(pmm.refcount(FrameNumber::new(run.as_u64() + i)), 1);
        }
        // The freed singleton gap must have been skipped.
        assert_ne!(run, b);
        let _ = a;
    }

    #[test]
    fn double_free_is_ignored() {
        let mut pmm = fresh(1024 * 1024);
        let f = pmm.alloc_frame().unwrap();
        let free_before = pmm.stats().free_frames;
        pmm.free_frame(f);
        pmm.free_frame(f);
        assert_eq!(pmm.stats().free_frames, free_before + 1);
    }

    #[test]
    fn frame_zero_is_guarded() {
        let mut pmm = fresh(1024 * 1024);
        let free_before = pmm.stats().free_frames;
        pmm.free_frame(FrameNumber::new(0));
        assert_eq!(pmm.stats().free_frames, free_before);
    }

    #[test]
    fn exhaustion_after_full_wrap() {
        let mut pmm = fresh(256 * 1024);
        let mut n = 0;
        while pmm.alloc_frame().is_ok() {
            n += 1;
            assert!(n < 1024, "allocator failed to report exhaustion");
        }
        assert_eq!(pmm.stats().free_frames, 0);
        assert_eq!(pmm.alloc_frame(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn unusable_map_is_rejected() {
        let mut pmm = FrameAllocator::empty();
        assert_eq!(
            pmm.init(&MemoryMap::empty()),
            Err(KernelError::MemoryMapUnusable)
        );
    }
}
