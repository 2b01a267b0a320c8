//! Kernel heap
//!
//! A coalescing first-fit allocator over HHDM-mapped frames pulled on
//! demand from the frame allocator. Every block carries a header with a
//! magic word; frees validate it and tolerate double frees (logged,
//! ignored) so a corrupted caller cannot take the allocator down with it.
//!
//! During early boot, before the frame allocator exists, allocations are
//! served from a small static arena through `linked_list_allocator`;
//! `init` flips the heap to the first-fit path.

use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::{phys_to_virt, pmm::FrameAllocator, FRAME_SIZE};
use crate::sync::SpinLock;

/// Magic word stamped into every live block header.
const HEAP_MAGIC: u32 = 0x454D_4252; // "EMBR"

/// Allocation granularity and guaranteed alignment.
const HEAP_ALIGN: usize = 16;

/// A split only happens when the residual tail can hold a header plus
/// one granule.
const MIN_SPLIT: usize = HEAP_ALIGN;

/// Frames requested from the PMM per growth step (64 KiB).
const GROW_FRAMES: u64 = 16;

/// Early-boot arena size.
#[cfg(target_os = "none")]
const BOOT_ARENA_SIZE: usize = 128 * 1024;

/// Block header preceding every payload. 32 bytes so payloads inherit
/// 16-byte alignment from frame-aligned chunks.
#[repr(C)]
struct BlockHeader {
    /// Payload capacity in bytes (multiple of `HEAP_ALIGN`)
    size: usize,
    /// Next block in address order (used and free alike)
    next: *mut BlockHeader,
    magic: u32,
    free: u32,
    _pad: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Heap statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    pub allocations: u64,
    pub frees: u64,
    pub grow_count: u64,
    pub bytes_managed: usize,
}

struct HeapInner {
    /// Address-ordered list of all blocks
    head: *mut BlockHeader,
    stats: HeapStats,
}

// SAFETY: the raw block pointers are only dereferenced under the heap
// lock, and the memory they point to is owned by the heap.
unsafe impl Send for HeapInner {}

impl HeapInner {
    const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            stats: HeapStats {
                allocations: 0,
                frees: 0,
                grow_count: 0,
                bytes_managed: 0,
            },
        }
    }

    /// First-fit allocation. Returns null when no free block fits.
    fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
        let size = size.max(1).div_ceil(HEAP_ALIGN) * HEAP_ALIGN;

        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: `cur` came from the address-ordered list, whose
            // nodes all live in heap-owned chunks.
            let block = unsafe { &mut *cur };
            let payload = cur as usize + HEADER_SIZE;
            if block.free != 0 && block.size >= size && payload % align == 0 {
                if block.size - size >= HEADER_SIZE + MIN_SPLIT {
                    // Split the residual tail into its own free block.
                    let tail = (payload + size) as *mut BlockHeader;
                    // SAFETY: the tail lies inside this block's payload,
                    // which the heap owns exclusively.
                    unsafe {
                        (*tail) = BlockHeader {
                            size: block.size - size - HEADER_SIZE,
                            next: block.next,
                            magic: HEAP_MAGIC,
                            free: 1,
                            _pad: 0,
                        };
                    }
                    block.next = tail;
                    block.size = size;
                }
                block.free = 0;
                self.stats.allocations += 1;
                return payload as *mut u8;
            }
            cur = block.next;
        }
        core::ptr::null_mut()
    }

    /// Free a payload pointer, coalescing with the physical successor and
    /// attempting one backward coalesce by list scan.
    fn free(&mut self, ptr: *mut u8) {
        let hdr = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: `ptr` was returned by `alloc`, so the header precedes
        // it inside a heap-owned chunk; the magic check below guards
        // against garbage pointers before any further access.
        let block = unsafe { &mut *hdr };
        if block.magic != HEAP_MAGIC {
            log::error!("[HEAP] free with corrupt header at {:p}, ignored", ptr);
            return;
        }
        if block.free != 0 {
            log::error!("[HEAP] double free at {:p}, ignored", ptr);
            return;
        }
        block.free = 1;
        self.stats.frees += 1;

        // Coalesce with the physical successor.
        let next = block.next;
        if !next.is_null() && block_end(hdr) == next as usize {
            // SAFETY: `next` is the list successor, inside heap memory.
            let next_block = unsafe { &mut *next };
            if next_block.free != 0 {
                block.size += HEADER_SIZE + next_block.size;
                block.next = next_block.next;
                next_block.magic = 0;
            }
        }

        // One backward pass: find a free predecessor whose end abuts
        // this header.
        let mut cur = self.head;
        while !cur.is_null() && cur != hdr {
            // SAFETY: list node in heap memory.
            let pred = unsafe { &mut *cur };
            if pred.free != 0 && block_end(cur) == hdr as usize {
                pred.size += HEADER_SIZE + block.size;
                pred.next = block.next;
                block.magic = 0;
                return;
            }
            cur = pred.next;
        }
    }

    /// Hand a fresh chunk of memory to the allocator, keeping the block
    /// list address-ordered.
    fn add_region(&mut self, start: usize, len: usize) {
        debug_assert!(start % HEAP_ALIGN == 0 && len > HEADER_SIZE + MIN_SPLIT);
        let hdr = start as *mut BlockHeader;

        // Find the insertion point by address.
        let mut prev: *mut BlockHeader = core::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() && (cur as usize) < start {
            // SAFETY: list node in heap memory.
            prev = cur;
            cur = unsafe { (*cur).next };
        }

        // SAFETY: the chunk `[start, start+len)` was just handed to the
        // heap and nothing else references it.
        unsafe {
            (*hdr) = BlockHeader {
                size: len - HEADER_SIZE,
                next: cur,
                magic: HEAP_MAGIC,
                free: 1,
                _pad: 0,
            };
        }
        if prev.is_null() {
            self.head = hdr;
        } else {
            // SAFETY: `prev` is a live list node.
            unsafe { (*prev).next = hdr };
        }
        self.stats.grow_count += 1;
        self.stats.bytes_managed += len;
    }
}

fn block_end(hdr: *mut BlockHeader) -> usize {
    // SAFETY: callers pass live list nodes.
    hdr as usize + HEADER_SIZE + unsafe { (*hdr).size }
}

/// The kernel heap: early-boot arena plus the growing first-fit region.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
    boot: linked_list_allocator::LockedHeap,
    boot_base: AtomicUsize,
    boot_end: AtomicUsize,
    ready: AtomicBool,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner::new()),
            boot: linked_list_allocator::LockedHeap::empty(),
            boot_base: AtomicUsize::new(0),
            boot_end: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
        }
    }

    /// Point the early-boot path at its static arena.
    ///
    /// # Safety
    ///
    /// `base..base+len` must be writable memory unused by anything else,
    /// and this must be called at most once, before any allocation.
    pub unsafe fn init_boot(&self, base: *mut u8, len: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.boot.lock().init(base, len) };
        self.boot_base.store(base as usize, Ordering::Release);
        self.boot_end.store(base as usize + len, Ordering::Release);
    }

    /// Switch from the boot arena to the first-fit path.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Allocate, growing from `pmm` when the free list has no fit.
    pub fn allocate_with(&self, layout: Layout, pmm: &Mutex<FrameAllocator>) -> *mut u8 {
        let align = layout.align().max(HEAP_ALIGN);
        let ptr = self.inner.lock().alloc(layout.size(), align);
        if !ptr.is_null() {
            return ptr;
        }

        // Grow outside the heap lock; the PMM has its own.
        let want = (layout.size() + HEADER_SIZE).max(GROW_FRAMES as usize * FRAME_SIZE);
        let frames = want.div_ceil(FRAME_SIZE) as u64;
        let chunk = match pmm.lock().alloc_frames(frames) {
            Ok(frame) => frame,
            Err(_) => return core::ptr::null_mut(),
        };
        let start = phys_to_virt(chunk.addr()) as usize;
        {
            let mut inner = self.inner.lock();
            inner.add_region(start, frames as usize * FRAME_SIZE);
            let ptr = inner.alloc(layout.size(), align);
            if ptr.is_null() {
                log::error!(
                    "[HEAP] fresh {}-frame chunk cannot satisfy {:?}",
                    frames,
                    layout
                );
            }
            ptr
        }
    }

    /// Free a pointer previously returned by `allocate_with`.
    pub fn deallocate(&self, ptr: *mut u8) {
        self.inner.lock().free(ptr);
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }

    fn in_boot_arena(&self, ptr: *mut u8) -> bool {
        let p = ptr as usize;
        p >= self.boot_base.load(Ordering::Acquire) && p < self.boot_end.load(Ordering::Acquire)
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: allocation routes through the global frame allocator and the
// IRQ-safe heap lock; both are sound under concurrent callers.
#[cfg(target_os = "none")]
unsafe impl core::alloc::GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if self.ready.load(Ordering::Acquire) {
            self.allocate_with(layout, &super::pmm::FRAME_ALLOCATOR)
        } else {
            self.boot
                .lock()
                .allocate_first_fit(layout)
                .map(|p| p.as_ptr())
                .unwrap_or(core::ptr::null_mut())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if self.in_boot_arena(ptr) {
            // SAFETY: the pointer was produced by the boot allocator for
            // this very layout.
            unsafe {
                self.boot
                    .lock()
                    .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout)
            };
        } else {
            self.deallocate(ptr);
        }
    }
}

/// The kernel's allocator instance. On bare metal it is the global
/// allocator; on the host the test harness uses the system allocator and
/// this instance is exercised directly.
#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();

#[cfg(target_os = "none")]
static mut BOOT_ARENA: [u8; BOOT_ARENA_SIZE] = [0; BOOT_ARENA_SIZE];

/// Hand the boot arena to the allocator (called before `mm::init`).
#[cfg(target_os = "none")]
pub fn init_boot_arena() {
    // SAFETY: BOOT_ARENA is only ever referenced here, once, at boot.
    unsafe {
        KERNEL_HEAP.init_boot(core::ptr::addr_of_mut!(BOOT_ARENA) as *mut u8, BOOT_ARENA_SIZE);
    }
}

/// Flip the heap onto the frame-backed first-fit path.
pub fn init() {
    KERNEL_HEAP.set_ready();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use spin::Mutex;

    use super::*;
    use crate::mm::testutil::fresh_pmm;

    fn heap_with_pmm() -> (KernelHeap, Mutex<FrameAllocator>) {
        (KernelHeap::new(), fresh_pmm(4 * 1024 * 1024))
    }

    fn alloc(heap: &KernelHeap, pmm: &Mutex<FrameAllocator>, size: usize) -> *mut u8 {
        let ptr = heap.allocate_with(Layout::from_size_align(size, 8).unwrap(), pmm);
        assert!(!ptr.is_null());
        ptr
    }

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let (heap, pmm) = heap_with_pmm();
        let a = alloc(&heap, &pmm, 24);
        let b = alloc(&heap, &pmm, 100);
        assert_ne!(a, b);
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
    }

    #[test]
    fn first_fit_reuses_freed_block() {
        let (heap, pmm) = heap_with_pmm();
        let _a = alloc(&heap, &pmm, 64);
        let b = alloc(&heap, &pmm, 64);
        let _c = alloc(&heap, &pmm, 64);
        heap.deallocate(b);
        let b2 = alloc(&heap, &pmm, 64);
        assert_eq!(b, b2);
    }

    #[test]
    fn split_leaves_usable_tail() {
        let (heap, pmm) = heap_with_pmm();
        let a = alloc(&heap, &pmm, 512);
        heap.deallocate(a);
        // A smaller allocation reuses the head of the freed block...
        let small = alloc(&heap, &pmm, 32);
        assert_eq!(small, a);
        // ...and the split tail serves the next one without growing.
        let grow_before = heap.stats().grow_count;
        let tail = alloc(&heap, &pmm, 128);
        assert_eq!(heap.stats().grow_count, grow_before);
        assert!((tail as usize) > (small as usize));
    }

    #[test]
    fn free_coalesces_neighbors() {
        let (heap, pmm) = heap_with_pmm();
        let a = alloc(&heap, &pmm, 64);
        let b = alloc(&heap, &pmm, 64);
        let c = alloc(&heap, &pmm, 64);
        let _guard = alloc(&heap, &pmm, 64);

        // Free middle, then its physical predecessor: the backward pass
        // merges them; then free the successor to fold forward too.
        heap.deallocate(b);
        heap.deallocate(a);
        heap.deallocate(c);

        // A request spanning all three (plus swallowed headers) now fits
        // at `a` without growing the heap.
        let grow_before = heap.stats().grow_count;
        let big = alloc(&heap, &pmm, 64 * 3 + 2 * HEADER_SIZE);
        assert_eq!(big, a);
        assert_eq!(heap.stats().grow_count, grow_before);
    }

    #[test]
    fn double_free_is_ignored() {
        let (heap, pmm) = heap_with_pmm();
        let a = alloc(&heap, &pmm, 64);
        let b = alloc(&heap, &pmm, 64);
        heap.deallocate(a);
        let frees = heap.stats().frees;
        heap.deallocate(a);
        assert_eq!(heap.stats().frees, frees);
        // The heap is still coherent.
        heap.deallocate(b);
        let again = alloc(&heap, &pmm, 64);
        assert!(!again.is_null());
    }

    #[test]
    fn corrupt_magic_is_ignored() {
        let (heap, pmm) = heap_with_pmm();
        let a = alloc(&heap, &pmm, 64);
        // Smash the magic word.
        // SAFETY: test writes inside the heap's own chunk.
        unsafe {
            let hdr = (a as usize - HEADER_SIZE) as *mut BlockHeader;
            (*hdr).magic = 0xDEAD_BEEF;
        }
        let frees = heap.stats().frees;
        heap.deallocate(a);
        assert_eq!(heap.stats().frees, frees);
    }

    #[test]
    fn grows_from_frame_allocator_on_demand() {
        let (heap, pmm) = heap_with_pmm();
        let before = pmm.lock().stats().free_frames;
        let _p = alloc(&heap, &pmm, 1024);
        let after = pmm.lock().stats().free_frames;
        assert_eq!(before - after, GROW_FRAMES);
        assert_eq!(heap.stats().grow_count, 1);

        // A chunk-sized-plus request forces another growth.
        let _big = alloc(&heap, &pmm, GROW_FRAMES as usize * FRAME_SIZE);
        assert_eq!(heap.stats().grow_count, 2);
    }
}
