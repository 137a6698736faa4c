//! # Virtual Memory Manager
//!
//! Range operations over [`AddressSpace`] trees: mapping, unmapping, device
//! windows, cloning and destruction. Every operation holds the page-table lock
//! for its whole duration and takes the frame lock only per frame, so the lock
//! order is always tables → frames.
//!
//! Each touched page is invalidated through the [`Tlb`] hooks.

use crate::frame_alloc::{BitmapFrameAlloc, FrameStats, LockedFrames};
use crate::heap::HeapBackend;
use crate::MemoryError;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::{SpinLock, YieldHook};
use kernel_vmem::{AddressSpace, PageEntryBits, PhysMapper, RootPage, Tlb, VmemError};

/// Page-table side of the memory manager.
pub struct Vmm<M: PhysMapper, T: Tlb> {
    mapper: M,
    tlb: T,
    kernel_root: RootPage,
    tables: SpinLock<()>,
    frames: SpinLock<BitmapFrameAlloc>,
}

/// The 4 KiB pages covering `[start, start + len)`.
fn page_span(start: VirtualAddress, len: u64) -> Result<(VirtualPage<Size4K>, u64), MemoryError> {
    if len == 0 {
        return Err(MemoryError::EmptyRange);
    }
    let end = start
        .checked_add(len)
        .and_then(VirtualAddress::align_up::<Size4K>)
        .ok_or(MemoryError::OutOfWindow(start.as_u64()))?;
    let first = start.page::<Size4K>();
    Ok((first, (end - first.base()) / PAGE_SIZE))
}

impl<M: PhysMapper, T: Tlb> Vmm<M, T> {
    pub const fn new(
        mapper: M,
        tlb: T,
        kernel_root: RootPage,
        frames: BitmapFrameAlloc,
        yield_hook: YieldHook,
    ) -> Self {
        Self {
            mapper,
            tlb,
            kernel_root,
            tables: SpinLock::with_yield((), yield_hook),
            frames: SpinLock::with_yield(frames, yield_hook),
        }
    }

    #[inline]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    /// Run `f` against the tree at `root` with the page-table lock held.
    pub fn with_space<R>(
        &self,
        root: RootPage,
        f: impl FnOnce(&AddressSpace<'_, M>, &mut LockedFrames<'_>) -> R,
    ) -> R {
        let _tables = self.tables.lock();
        let space = AddressSpace::from_root(&self.mapper, root);
        let mut frames = LockedFrames::new(&self.frames);
        f(&space, &mut frames)
    }

    /// Run `f` with the frame allocator locked.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut BitmapFrameAlloc) -> R) -> R {
        self.frames.with_lock(f)
    }

    /// # Errors
    /// [`MemoryError::OutOfFrames`] when every frame is in use.
    pub fn alloc_frame(&self) -> Result<PhysicalPage<Size4K>, MemoryError> {
        self.frames.with_lock(BitmapFrameAlloc::alloc)
    }

    /// # Errors
    /// [`MemoryError::InvalidFree`] in strict mode.
    pub fn free_frame(&self, page: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        self.frames.with_lock(|f| f.free(page))
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.with_lock(|f| f.stats())
    }

    /// Back every page of `[start, start + len)` with a zeroed frame.
    /// Pages that are already mapped keep their frame.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRange`] for `len == 0`.
    /// - [`MemoryError::OutOfFrames`] when a frame cannot be allocated.
    pub fn map_pages(
        &self,
        root: RootPage,
        start: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let (first, count) = page_span(start, len)?;
        self.with_space(root, |space, frames| {
            for page in (0..count).map(|i| first.forward(i)) {
                space.resolve_or_create(frames, page.base(), flags, true)?;
                self.tlb.invalidate_page(page);
            }
            Ok::<_, VmemError>(())
        })?;
        log::trace!("mapped {count} page(s) at {}", first.base());
        Ok(())
    }

    /// Map `[start, start + len)` onto the physical range starting at `pa`.
    /// The frames stay owned by the caller.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRange`] for `len == 0`.
    /// - [`MemoryError::OutOfFrames`] when a page table cannot be allocated.
    pub fn map_frames(
        &self,
        root: RootPage,
        start: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        let (first, count) = page_span(start, len)?;
        let frame = pa.page::<Size4K>().base();
        self.with_space(root, |space, frames| {
            for i in 0..count {
                let page = first.forward(i);
                let target = PhysicalPage::from_addr(frame + i * PAGE_SIZE);
                space.map_frame(frames, page.base(), target, flags)?;
                self.tlb.invalidate_page(page);
            }
            Ok::<_, VmemError>(())
        })?;
        log::trace!("mapped {count} borrowed page(s) at {} -> {pa}", first.base());
        Ok(())
    }

    /// Unmap every page of `[start, start + len)`. Returns the number of pages
    /// that were actually mapped.
    ///
    /// # Errors
    /// [`MemoryError::EmptyRange`] for `len == 0`.
    pub fn unmap_pages(&self, root: RootPage, start: VirtualAddress, len: u64) -> Result<u64, MemoryError> {
        let (first, count) = page_span(start, len)?;
        let unmapped = self.with_space(root, |space, frames| {
            let mut unmapped = 0;
            for page in (0..count).map(|i| first.forward(i)) {
                if space.unmap_page(frames, page.base()).is_some() {
                    self.tlb.invalidate_page(page);
                    unmapped += 1;
                }
            }
            unmapped
        });
        log::trace!("unmapped {unmapped} of {count} page(s) at {}", first.base());
        Ok(unmapped)
    }

    /// Install `frame` at `va` in `root`.
    ///
    /// # Errors
    /// See [`AddressSpace::map_frame`].
    pub fn map_frame(
        &self,
        root: RootPage,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        self.with_space(root, |space, frames| space.map_frame(frames, va, frame, flags))?;
        self.tlb.invalidate_page(va.page());
        Ok(())
    }

    /// Lowest address in `[from, to)` with `len` unmapped bytes after it.
    ///
    /// # Errors
    /// [`MemoryError::NoFreeRange`] if there is none.
    pub fn find_free(
        &self,
        root: RootPage,
        len: u64,
        from: VirtualAddress,
        to: VirtualAddress,
    ) -> Result<VirtualAddress, MemoryError> {
        self.with_space(root, |space, _| space.find_free_range(len, from, to))
            .ok_or(MemoryError::NoFreeRange(len))
    }

    #[must_use]
    pub fn query(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.with_space(root, |space, _| space.query(va))
    }

    /// Pointer to the byte at `va` in `root`, reached through the mapper.
    ///
    /// # Errors
    /// [`MemoryError::Unmapped`] if `va` has no translation.
    pub fn ptr_at(&self, root: RootPage, va: VirtualAddress) -> Result<*mut u8, MemoryError> {
        let pa = self
            .query(root, va)
            .ok_or(MemoryError::Unmapped(va.as_u64()))?;
        // SAFETY: `pa` backs a live mapping and is therefore inside physical memory.
        Ok(unsafe { self.mapper.phys_to_ptr(pa) })
    }

    /// # Errors
    /// [`MemoryError::OutOfFrames`]; nothing is leaked in that case.
    pub fn clone_space(&self, root: RootPage) -> Result<RootPage, MemoryError> {
        let copy = self.with_space(root, |space, frames| {
            space.clone_space(frames).map(|copy| copy.root_page())
        })?;
        Ok(copy)
    }

    /// Free every frame owned by the tree at `root`.
    pub fn destroy_space(&self, root: RootPage) {
        let _tables = self.tables.lock();
        AddressSpace::from_root(&self.mapper, root).destroy(&mut LockedFrames::new(&self.frames));
    }

    /// Make `root` the active address space.
    ///
    /// # Safety
    /// See [`Tlb::load_root`].
    pub unsafe fn activate(&self, root: RootPage) {
        let _tables = self.tables.lock();
        unsafe { self.tlb.load_root(root) };
    }

    /// Pre-create the kernel-shared top-level tables, the self-reference and,
    /// if asked, the identity window in the kernel root.
    ///
    /// # Errors
    /// [`MemoryError::OutOfFrames`] or a conflicting entry in a reserved slot.
    pub fn prepare_kernel_root(&self, shared: &[usize], identity_window: bool) -> Result<(), MemoryError> {
        self.with_space(self.kernel_root, |space, frames| {
            space.ensure_self_reference();
            for &slot in shared {
                space.ensure_top_table(frames, slot)?;
            }
            if identity_window {
                space.install_identity_window(frames)?;
            }
            Ok::<_, VmemError>(())
        })?;
        Ok(())
    }
}

/// The kernel heap lives in the kernel root.
impl<M: PhysMapper, T: Tlb> HeapBackend for Vmm<M, T> {
    fn map_range(&self, start: VirtualAddress, len: u64) -> Result<(), MemoryError> {
        self.map_pages(self.kernel_root, start, len, PageEntryBits::kernel_rw())
    }

    fn unmap_range(&self, start: VirtualAddress, len: u64) {
        if let Ok(pages) = self.unmap_pages(self.kernel_root, start, len) {
            log::debug!("heap released {pages} page(s) from {start}");
        }
    }
}
