//! Per-process address spaces
//!
//! An [`AddressSpace`] owns a 4-level page-table hierarchy rooted at its
//! CR3 frame, the VMA list describing user mappings, and the process break.
//! The kernel half (upper 256 PML4 slots) is shared by reference with every
//! address space: the entries are copied from a template captured at boot,
//! so the deep kernel mappings exist exactly once.
//!
//! Fork is copy-on-write: `clone_for_fork` downgrades every writable user
//! page to read-only + COW in both parent and child and bumps the frame
//! refcount; the write-fault path copies the frame for the faulting side
//! only and drops one reference.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{
    page_table::{table_at, PageTable, PageTableEntry, PAGE_TABLE_ENTRIES},
    phys_to_virt,
    pmm::{FrameAllocator, FrameNumber},
    vma::VmaSet,
    PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// PML4 slots belonging to user space; the rest are the kernel half.
pub const USER_PML4_ENTRIES: usize = 256;

/// Default base of the downward-growing mmap area.
pub const USER_MMAP_BASE: u64 = 0x7000_0000_0000;

/// Top of the user stack region (exclusive).
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Kernel-half PML4 template, captured once during bootstrap from the
/// boot page tables. Zero until then; address spaces created earlier
/// (host tests) get an empty kernel half.
static KERNEL_TEMPLATE: AtomicU64 = AtomicU64::new(0);

/// Address-space id allocator (0 is reserved for "kernel only").
static NEXT_ASID: AtomicU64 = AtomicU64::new(1);

/// Record the physical address of the boot PML4 whose upper half every
/// new address space shares.
pub fn set_kernel_template(root: PhysicalAddress) {
    KERNEL_TEMPLATE.store(root.as_u64(), Ordering::Release);
}

/// A user address space.
pub struct AddressSpace {
    /// Physical address of the PML4 frame (the CR3 value); 0 once destroyed
    root: u64,
    /// Address-space id, used for futex keying and diagnostics
    id: u64,
    /// User mappings, under their own lock per the concurrency model
    pub vmas: Mutex<VmaSet>,
    /// Process break (top of the heap segment)
    brk: AtomicU64,
}

impl AddressSpace {
    /// Allocate a fresh address space with an empty user half and the
    /// shared kernel half.
    pub fn new(pmm: &Mutex<FrameAllocator>) -> KernelResult<Self> {
        let root = alloc_table(pmm)?;

        let template = KERNEL_TEMPLATE.load(Ordering::Acquire);
        if template != 0 {
            // SAFETY: `root` was just allocated and zeroed and is owned
            // exclusively here; the template root is the live boot PML4,
            // read-only in this scope. Both are HHDM-reachable.
            unsafe {
                let dst = table_at(root);
                let src = table_at(PhysicalAddress::new(template));
                for i in USER_PML4_ENTRIES..PAGE_TABLE_ENTRIES {
                    dst[i] = src[i];
                }
            }
        }

        Ok(Self {
            root: root.as_u64(),
            id: NEXT_ASID.fetch_add(1, Ordering::Relaxed),
            vmas: Mutex::new(VmaSet::new(USER_MMAP_BASE)),
            brk: AtomicU64::new(0),
        })
    }

    pub fn cr3(&self) -> u64 {
        self.root
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn brk(&self) -> u64 {
        self.brk.load(Ordering::Acquire)
    }

    pub fn set_brk(&self, brk: u64) {
        self.brk.store(brk, Ordering::Release);
    }

    /// Install a mapping `va -> pa`, allocating intermediate tables as
    /// needed. `PRESENT` is implied. Only the user half may be mapped.
    pub fn map(
        &mut self,
        pmm: &Mutex<FrameAllocator>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !va.is_page_aligned() || !pa.is_frame_aligned() {
            return Err(KernelError::Invalid);
        }
        let entry = self.walk_create(pmm, va)?;
        if entry.is_present() {
            return Err(KernelError::AlreadyExists);
        }
        entry.set(pa, flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Clear the mapping at `va`. With `decref_frame`, also drop one
    /// reference to the backing frame (freeing it at zero).
    pub fn unmap(
        &mut self,
        pmm: &Mutex<FrameAllocator>,
        va: VirtualAddress,
        decref_frame: bool,
    ) -> KernelResult<()> {
        let entry = self.walk(va).ok_or(KernelError::NotFound)?;
        let pa = entry.addr().ok_or(KernelError::NotFound)?;
        entry.clear();
        if decref_frame {
            pmm.lock().decref(pa.frame());
        }
        crate::arch::tlb_flush(va.as_u64());
        Ok(())
    }

    /// Resolve `va` to a physical address, honoring the page offset.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.walk_ref(va)?;
        let base = entry.addr()?;
        Some(PhysicalAddress::new(
            base.as_u64() + (va.as_u64() % FRAME_SIZE as u64),
        ))
    }

    /// Clone for fork: share every user page copy-on-write.
    ///
    /// Writable (and already-COW) pages lose `WRITABLE` and gain `COW` in
    /// both hierarchies; read-only pages are shared as-is. Every shared
    /// frame gains one reference for the child's mapping, keeping the sum
    /// of refcounts equal to the number of live mappings.
    pub fn clone_for_fork(&mut self, pmm: &Mutex<FrameAllocator>) -> KernelResult<Self> {
        let mut child = Self::new(pmm)?;

        // SAFETY: `self.root` is this space's live PML4, mutated only
        // through `&mut self`; the walk stays inside the user half, which
        // no other address space references.
        let root = unsafe { table_at(PhysicalAddress::new(self.root)) };
        for l4 in 0..USER_PML4_ENTRIES {
            let Some(l3_pa) = root[l4].addr() else { continue };
            // SAFETY: `l3_pa` came from a present entry of an owned table.
            let l3 = unsafe { table_at(l3_pa) };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_pa) = l3[i3].addr() else { continue };
                if l3[i3].flags().contains(PageFlags::HUGE) {
                    log::warn!("[VAS] skipping 1 GiB huge page during fork");
                    continue;
                }
                // SAFETY: as above, one level down.
                let l2 = unsafe { table_at(l2_pa) };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let Some(l1_pa) = l2[i2].addr() else { continue };
                    if l2[i2].flags().contains(PageFlags::HUGE) {
                        log::warn!("[VAS] skipping 2 MiB huge page during fork");
                        continue;
                    }
                    // SAFETY: as above, leaf table.
                    let l1 = unsafe { table_at(l1_pa) };
                    for i1 in 0..PAGE_TABLE_ENTRIES {
                        let entry = &mut l1[i1];
                        let Some(frame_pa) = entry.addr() else { continue };

                        let mut flags = entry.flags();
                        if flags.intersects(PageFlags::WRITABLE | PageFlags::COW) {
                            flags.remove(PageFlags::WRITABLE);
                            flags.insert(PageFlags::COW);
                            entry.set_flags(flags);
                        }
                        pmm.lock().incref(frame_pa.frame());

                        let va = VirtualAddress::new(
                            ((l4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12),
                        );
                        let child_entry = child.walk_create(pmm, va)?;
                        child_entry.set(frame_pa, flags);
                    }
                }
            }
        }

        *child.vmas.lock() = self.vmas.lock().clone();
        child.brk.store(self.brk(), Ordering::Release);

        // The source lost write permission on shared pages.
        crate::arch::tlb_flush_all();
        Ok(child)
    }

    /// Resolve a write fault on a COW page.
    ///
    /// With the last reference, the page is simply made writable again;
    /// otherwise a fresh frame is allocated, the contents copied, and one
    /// reference dropped from the shared frame.
    pub fn handle_cow_fault(
        &mut self,
        pmm: &Mutex<FrameAllocator>,
        va: VirtualAddress,
    ) -> KernelResult<()> {
        let entry = self.walk(va).ok_or(KernelError::NotFound)?;
        let flags = entry.flags();
        if !flags.contains(PageFlags::COW) {
            return Err(KernelError::Invalid);
        }
        let old_pa = entry.addr().ok_or(KernelError::NotFound)?;
        let old_frame = old_pa.frame();

        let mut new_flags = flags;
        new_flags.remove(PageFlags::COW);
        new_flags.insert(PageFlags::WRITABLE);

        if pmm.lock().refcount(old_frame) == 1 {
            entry.set_flags(new_flags);
        } else {
            let new_frame = pmm.lock().alloc_frame()?;
            // SAFETY: both frames are live RAM reachable through the HHDM;
            // the new frame is exclusively owned, and the old frame is only
            // read. The ranges cannot overlap (distinct frames).
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(old_pa),
                    phys_to_virt(new_frame.addr()),
                    FRAME_SIZE,
                );
            }
            entry.set(new_frame.addr(), new_flags);
            pmm.lock().decref(old_frame);
        }
        crate::arch::tlb_flush(va.as_u64());
        Ok(())
    }

    /// Tear down the user half: drop a reference on every mapped frame,
    /// free every intermediate table frame, then the root. The kernel
    /// half is shared and is left untouched.
    pub fn destroy(&mut self, pmm: &Mutex<FrameAllocator>) {
        if self.root == 0 {
            return;
        }
        // SAFETY: `self.root` is this space's live PML4; after this walk
        // the root is forgotten, so no dangling access can follow.
        let root = unsafe { table_at(PhysicalAddress::new(self.root)) };
        for l4 in 0..USER_PML4_ENTRIES {
            let Some(l3_pa) = root[l4].addr() else { continue };
            // SAFETY: present entry of an owned table.
            let l3 = unsafe { table_at(l3_pa) };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_pa) = l3[i3].addr() else { continue };
                if l3[i3].flags().contains(PageFlags::HUGE) {
                    continue;
                }
                // SAFETY: present entry of an owned table.
                let l2 = unsafe { table_at(l2_pa) };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let Some(l1_pa) = l2[i2].addr() else { continue };
                    if l2[i2].flags().contains(PageFlags::HUGE) {
                        continue;
                    }
                    // SAFETY: present entry of an owned table.
                    let l1 = unsafe { table_at(l1_pa) };
                    for i1 in 0..PAGE_TABLE_ENTRIES {
                        if let Some(frame_pa) = l1[i1].addr() {
                            pmm.lock().decref(frame_pa.frame());
                        }
                    }
                    pmm.lock().free_frame(l1_pa.frame());
                }
                pmm.lock().free_frame(l2_pa.frame());
            }
            pmm.lock().free_frame(l3_pa.frame());
        }
        pmm.lock().free_frame(PhysicalAddress::new(self.root).frame());
        self.root = 0;
    }

    /// Walk to the leaf entry for `va`, creating intermediate tables.
    fn walk_create(
        &mut self,
        pmm: &Mutex<FrameAllocator>,
        va: VirtualAddress,
    ) -> KernelResult<&mut PageTableEntry> {
        let [l4, l3, l2, l1] = va.table_indices();
        if l4 >= USER_PML4_ENTRIES {
            return Err(KernelError::Invalid);
        }

        let intermediate = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        // SAFETY: `self.root` is this space's live PML4 and `&mut self`
        // guarantees exclusive access to the whole user hierarchy.
        let mut table = unsafe { table_at(PhysicalAddress::new(self.root)) };
        for idx in [l4, l3, l2] {
            let entry = &mut table[idx];
            let next = match entry.addr() {
                Some(pa) => pa,
                None => {
                    let pa = alloc_table(pmm)?;
                    entry.set(pa, intermediate);
                    pa
                }
            };
            // SAFETY: `next` is a table frame owned by this hierarchy.
            table = unsafe { table_at(next) };
        }
        Ok(&mut table[l1])
    }

    /// Walk to the leaf entry for `va` without creating tables.
    fn walk(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let [l4, l3, l2, l1] = va.table_indices();
        if l4 >= USER_PML4_ENTRIES || self.root == 0 {
            return None;
        }
        // SAFETY: as in `walk_create`.
        let mut table = unsafe { table_at(PhysicalAddress::new(self.root)) };
        for idx in [l4, l3, l2] {
            let pa = table[idx].addr()?;
            // SAFETY: present entry of an owned table.
            table = unsafe { table_at(pa) };
        }
        Some(&mut table[l1])
    }

    /// Read-only walk used by `translate`.
    fn walk_ref(&self, va: VirtualAddress) -> Option<&PageTableEntry> {
        let [l4, l3, l2, l1] = va.table_indices();
        if l4 >= USER_PML4_ENTRIES || self.root == 0 {
            return None;
        }
        // SAFETY: read-only traversal of this space's own hierarchy.
        let mut table: &PageTable = unsafe { table_at(PhysicalAddress::new(self.root)) };
        for idx in [l4, l3, l2] {
            let pa = table[idx].addr()?;
            // SAFETY: present entry of an owned table.
            table = unsafe { table_at(pa) };
        }
        Some(&table[l1])
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.root != 0 {
            log::warn!(
                "[VAS] address space {} dropped without destroy; {} leaks its tables",
                self.id,
                self.root
            );
        }
    }
}

/// Allocate and zero one page-table frame.
fn alloc_table(pmm: &Mutex<FrameAllocator>) -> KernelResult<PhysicalAddress> {
    let frame = pmm.lock().alloc_frame()?;
    let pa = frame.addr();
    // SAFETY: the frame was just allocated and is exclusively owned; the
    // HHDM maps it.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(pa), 0, FRAME_SIZE);
    }
    Ok(pa)
}

/// Allocate a user data frame and return its number (refcount 1).
pub fn alloc_user_frame(pmm: &Mutex<FrameAllocator>) -> KernelResult<FrameNumber> {
    let frame = pmm.lock().alloc_frame()?;
    // SAFETY: just-allocated frame, exclusively owned, HHDM-mapped.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame.addr()), 0, FRAME_SIZE);
    }
    Ok(frame)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testutil::fresh_pmm;

    const USER_VA: u64 = 0x40_0000;

    fn user_flags() -> PageFlags {
        PageFlags::WRITABLE | PageFlags::USER
    }

    /// Read one byte of user memory by walking the page tables, the way
    /// the kernel would through the HHDM.
    fn read_user(space: &AddressSpace, va: u64) -> u8 {
        let pa = space
            .translate(VirtualAddress::new(va))
            .expect("address must be mapped");
        // SAFETY: `pa` points into the test arena.
        unsafe { *phys_to_virt(pa) }
    }

    fn write_user(space: &AddressSpace, va: u64, value: u8) {
        let pa = space
            .translate(VirtualAddress::new(va))
            .expect("address must be mapped");
        // SAFETY: `pa` points into the test arena.
        unsafe { *phys_to_virt(pa) = value };
    }

    #[test]
    fn map_translate_unmap() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let mut space = AddressSpace::new(&pmm).unwrap();

        let frame = alloc_user_frame(&pmm).unwrap();
        space
            .map(
                &pmm,
                VirtualAddress::new(USER_VA),
                frame.addr(),
                user_flags(),
            )
            .unwrap();

        let pa = space.translate(VirtualAddress::new(USER_VA + 0x123)).unwrap();
        assert_eq!(pa.as_u64(), frame.addr().as_u64() + 0x123);

        // Remapping the same page is refused.
        assert_eq!(
            space.map(
                &pmm,
                VirtualAddress::new(USER_VA),
                frame.addr(),
                user_flags(),
            ),
            Err(KernelError::AlreadyExists)
        );

        space
            .unmap(&pmm, VirtualAddress::new(USER_VA), true)
            .unwrap();
        assert!(space.translate(VirtualAddress::new(USER_VA)).is_none());
        assert_eq!(pmm.lock().refcount(frame), 0);

        space.destroy(&pmm);
    }

    #[test]
    fn kernel_half_mapping_is_rejected() {
        let pmm = fresh_pmm(4 * 1024 * 1024);
        let mut space = AddressSpace::new(&pmm).unwrap();
        let frame = alloc_user_frame(&pmm).unwrap();
        assert_eq!(
            space.map(
                &pmm,
                VirtualAddress::new(0xFFFF_8000_0000_0000),
                frame.addr(),
                user_flags(),
            ),
            Err(KernelError::Invalid)
        );
        pmm.lock().free_frame(frame);
        space.destroy(&pmm);
    }

    #[test]
    fn cow_fork_shares_then_copies() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let mut parent = AddressSpace::new(&pmm).unwrap();

        let frame = alloc_user_frame(&pmm).unwrap();
        parent
            .map(
                &pmm,
                VirtualAddress::new(USER_VA),
                frame.addr(),
                user_flags(),
            )
            .unwrap();
        write_user(&parent, USER_VA, 42);

        let child = parent.clone_for_fork(&pmm).unwrap();
        let mut child = child;

        // Both sides read the shared value; the frame has two owners.
        assert_eq!(read_user(&parent, USER_VA), 42);
        assert_eq!(read_user(&child, USER_VA), 42);
        assert_eq!(pmm.lock().refcount(frame), 2);

        // The parent faults on write and gets a private copy.
        parent
            .handle_cow_fault(&pmm, VirtualAddress::new(USER_VA))
            .unwrap();
        write_user(&parent, USER_VA, 99);

        assert_eq!(read_user(&parent, USER_VA), 99);
        assert_eq!(read_user(&child, USER_VA), 42);
        assert_eq!(pmm.lock().refcount(frame), 1);

        let parent_pa = parent.translate(VirtualAddress::new(USER_VA)).unwrap();
        let child_pa = child.translate(VirtualAddress::new(USER_VA)).unwrap();
        assert_ne!(parent_pa, child_pa);
        assert_eq!(child_pa.as_u64(), frame.addr().as_u64());
        assert_eq!(pmm.lock().refcount(parent_pa.frame()), 1);

        parent.destroy(&pmm);
        child.destroy(&pmm);
    }

    #[test]
    fn cow_fault_with_sole_owner_restores_write() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let mut parent = AddressSpace::new(&pmm).unwrap();
        let frame = alloc_user_frame(&pmm).unwrap();
        parent
            .map(
                &pmm,
                VirtualAddress::new(USER_VA),
                frame.addr(),
                user_flags(),
            )
            .unwrap();

        {
            let mut child = parent.clone_for_fork(&pmm).unwrap();
            child.destroy(&pmm);
        }
        // The child is gone; the parent is the sole owner again.
        assert_eq!(pmm.lock().refcount(frame), 1);
        parent
            .handle_cow_fault(&pmm, VirtualAddress::new(USER_VA))
            .unwrap();
        // Same frame, writable again.
        let pa = parent.translate(VirtualAddress::new(USER_VA)).unwrap();
        assert_eq!(pa.frame(), frame);

        parent.destroy(&pmm);
    }

    #[test]
    fn fork_then_destroy_restores_frame_accounting() {
        let pmm = fresh_pmm(8 * 1024 * 1024);
        let baseline = pmm.lock().stats().free_frames;

        let mut parent = AddressSpace::new(&pmm).unwrap();
        for i in 0..4 {
            let frame = alloc_user_frame(&pmm).unwrap();
            parent
                .map(
                    &pmm,
                    VirtualAddress::new(USER_VA + i * FRAME_SIZE as u64),
                    frame.addr(),
                    user_flags(),
                )
                .unwrap();
        }

        let mut child = parent.clone_for_fork(&pmm).unwrap();
        parent
            .handle_cow_fault(&pmm, VirtualAddress::new(USER_VA))
            .unwrap();

        parent.destroy(&pmm);
        child.destroy(&pmm);

        assert_eq!(pmm.lock().stats().free_frames, baseline);
    }
}
