//! # Address Space (x86-64, PML4-rooted)
//!
//! Operations on a **single** virtual address space. The tree is reached
//! through a [`PhysMapper`], frames come from a caller-supplied [`FrameAlloc`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::resolve_or_create`] walks top→leaf, optionally creating
//!   missing levels and the leaf frame.
//! - [`AddressSpace::map_frame`] installs a caller-owned frame.
//! - [`AddressSpace::unmap_page`] clears a leaf and frees the frame it owns.
//! - [`AddressSpace::query`] translates a VA to a PA, large pages included.
//! - [`AddressSpace::find_free_range`] looks for a run of unmapped pages.
//! - [`AddressSpace::clone_space`] and [`AddressSpace::destroy`] (in `clone`).
//!
//! ## Ownership
//!
//! A frame referenced from a table is *owned* by the space when it is one of:
//! - an intermediate table outside the kernel-shared top-level slots,
//! - a user-accessible leaf without the `borrowed` bit.
//!
//! Everything else (kernel-shared subtrees, large pages, supervisor leaves in
//! private subtrees, borrowed frames) is only referenced. Clone copies what is
//! owned and shares the rest; destroy frees exactly what is owned.
//!
//! ## Safety
//!
//! Mutating active mappings requires TLB maintenance; callers pair every
//! change with [`Tlb::invalidate_page`](crate::Tlb::invalidate_page).

mod clone;

use crate::{EntryKind, FrameAlloc, PageEntryBits, PageTable, PhysMapper, TableLevel, VmemError};
use kernel_info::memory::{
    ENTRIES_PER_TABLE, IDENTITY_WINDOW_SLOT, PAGE_SIZE, SELF_REFERENCE_SLOT,
};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size4K, VirtualAddress,
};

/// The PML4 root page for an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

/// Where a walk down to the page table level ended.
enum Descent {
    /// Reached the page table holding the leaf.
    Table(PhysicalPage<Size4K>),
    /// A large page covers the address; carries the translated address.
    Large(PhysicalAddress),
    /// An upper level is missing and creation was not requested.
    Missing,
    /// A reserved entry blocks the walk.
    Blocked,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing tree.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate an empty tree whose self-reference slot points at itself.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if no frame is left for the root.
    pub fn create<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, VmemError> {
        let root = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        let space = Self::from_root(mapper, root);
        let pml4 = space.table(root);
        pml4.zero();
        pml4.set_kind(
            SELF_REFERENCE_SLOT,
            EntryKind::NextLevel(root, PageEntryBits::kernel_rw()),
        );
        Ok(space)
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Point the self-reference slot at the root if it is empty.
    pub fn ensure_self_reference(&self) {
        let pml4 = self.table(self.root);
        if pml4.get(SELF_REFERENCE_SLOT).is_zero() {
            pml4.set_kind(
                SELF_REFERENCE_SLOT,
                EntryKind::NextLevel(self.root, PageEntryBits::kernel_rw()),
            );
        }
    }

    /// Make sure top-level `slot` points at a table, allocating an empty one
    /// if needed. Used for the kernel-shared slots, which must exist before
    /// the first clone so that every copy references the same subtree.
    ///
    /// # Errors
    /// - [`VmemError::OutOfFrames`] if no frame is left.
    /// - [`VmemError::ReservedEntry`] if the slot holds anything but a table.
    pub fn ensure_top_table<A: FrameAlloc>(&self, alloc: &mut A, slot: usize) -> Result<(), VmemError> {
        let pml4 = self.table(self.root);
        let va = VirtualAddress::new(kernel_info::memory::slot_base(slot));
        match pml4.kind(TableLevel::Pml4, slot) {
            EntryKind::NextLevel(..) => Ok(()),
            EntryKind::Empty => {
                let page = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
                self.table(page).zero();
                pml4.set_kind(slot, EntryKind::NextLevel(page, PageEntryBits::kernel_rw()));
                log::debug!("created shared top-level table {page} for slot {slot}");
                Ok(())
            }
            _ => Err(VmemError::ReservedEntry(va)),
        }
    }

    /// Raw top-level entry `slot`.
    #[inline]
    #[must_use]
    pub fn top_entry(&self, slot: usize) -> PageEntryBits {
        self.table(self.root).get(slot)
    }

    /// Borrow the table stored in `page`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn table(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: every page handed in is a table frame of this tree or a
        // freshly allocated frame about to become one.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Borrow the 4 KiB frame `page` as bytes.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn frame_bytes(&self, page: PhysicalPage<Size4K>) -> &mut [u8; 4096] {
        // SAFETY: `page` is a frame owned by the allocator handing it to us.
        unsafe { self.mapper.phys_to_mut::<[u8; 4096]>(page.base()) }
    }

    /// Walk PML4 → PDPT → PD for `va`. Missing tables are created if `alloc`
    /// is given, with flags derived from `leaf_flags`.
    fn descend<A: FrameAlloc>(
        &self,
        mut alloc: Option<&mut A>,
        va: VirtualAddress,
        leaf_flags: PageEntryBits,
    ) -> Result<Descent, VmemError> {
        let mut page = self.root;
        let mut level = TableLevel::Pml4;
        while let Some(next_level) = level.next() {
            let table = self.table(page);
            let index = level.index_of(va);
            page = match table.kind(level, index) {
                EntryKind::NextLevel(next, flags) => {
                    if leaf_flags.user_access() && !flags.user_access() && alloc.is_some() {
                        table.set_kind(index, EntryKind::NextLevel(next, flags.with_user_access(true)));
                    }
                    next
                }
                EntryKind::LargeLeaf(base, _) => {
                    let offset = va.as_u64() & (level.span() - 1);
                    return Ok(Descent::Large(base + offset));
                }
                EntryKind::Empty => {
                    let Some(alloc) = alloc.as_deref_mut() else {
                        return Ok(Descent::Missing);
                    };
                    let next = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
                    self.table(next).zero();
                    table.set_kind(index, EntryKind::NextLevel(next, PageEntryBits::table_for(leaf_flags)));
                    log::debug!("created {next_level:?} table {next} for {va}");
                    next
                }
                EntryKind::Reserved(_) | EntryKind::Leaf(..) => return Ok(Descent::Blocked),
            };
            level = next_level;
        }
        Ok(Descent::Table(page))
    }

    /// Walk to the leaf for `va`.
    ///
    /// - With `create == false` this never allocates and returns `Ok(None)`
    ///   when any level, or the leaf itself, is empty.
    /// - With `create == true` missing levels get a zeroed frame each, and an
    ///   empty leaf gets a fresh zeroed frame mapped with `flags`. An already
    ///   present leaf is returned as is, so remapping never leaks a frame.
    ///
    /// Addresses inside a large page resolve to the 4 KiB frame within it.
    ///
    /// # Errors
    /// - [`VmemError::OutOfFrames`] when a frame is needed but none is left.
    /// - [`VmemError::ReservedEntry`] when creation hits a reserved entry.
    pub fn resolve_or_create<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        flags: PageEntryBits,
        create: bool,
    ) -> Result<Option<PhysicalPage<Size4K>>, VmemError> {
        let walk = self.descend(create.then_some(&mut *alloc), va, flags)?;
        let pt_page = match walk {
            Descent::Table(page) => page,
            Descent::Large(pa) => return Ok(Some(pa.page::<Size4K>())),
            Descent::Missing => return Ok(None),
            Descent::Blocked if create => return Err(VmemError::ReservedEntry(va)),
            Descent::Blocked => return Ok(None),
        };

        let pt = self.table(pt_page);
        let index = TableLevel::Pt.index_of(va);
        match pt.kind(TableLevel::Pt, index) {
            EntryKind::Leaf(page, _) => Ok(Some(page)),
            EntryKind::Empty if create => {
                let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
                self.frame_bytes(frame).fill(0);
                pt.set_kind(index, EntryKind::Leaf(frame, flags.with_borrowed(false)));
                log::trace!("mapped {va} -> {frame}");
                Ok(Some(frame))
            }
            EntryKind::Reserved(_) if create => Err(VmemError::ReservedEntry(va)),
            _ => Ok(None),
        }
    }

    /// Map `va` to a frame the caller owns. The leaf is marked borrowed.
    ///
    /// An owned frame previously mapped at `va` is returned to `alloc`.
    ///
    /// # Errors
    /// - [`VmemError::OutOfFrames`] if an intermediate table cannot be allocated.
    /// - [`VmemError::LargePageInTheWay`] if a large page covers `va`.
    /// - [`VmemError::ReservedEntry`] if a reserved entry covers `va`.
    pub fn map_frame<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        let pt_page = match self.descend(Some(&mut *alloc), va, flags)? {
            Descent::Table(page) => page,
            Descent::Large(_) => return Err(VmemError::LargePageInTheWay(va)),
            Descent::Missing | Descent::Blocked => return Err(VmemError::ReservedEntry(va)),
        };

        let pt = self.table(pt_page);
        let index = TableLevel::Pt.index_of(va);
        match pt.kind(TableLevel::Pt, index) {
            EntryKind::Leaf(old, old_flags) if old != frame && !old_flags.borrowed() => {
                alloc.free_4k(old);
            }
            EntryKind::Reserved(_) => return Err(VmemError::ReservedEntry(va)),
            _ => {}
        }
        pt.set_kind(index, EntryKind::Leaf(frame, flags.with_borrowed(true)));
        log::trace!("mapped {va} -> borrowed {frame}");
        Ok(())
    }

    /// Clear the 4 KiB leaf at `va` without creating anything on the way.
    ///
    /// Returns the frame that was mapped, if any. Owned frames are returned to
    /// `alloc`; borrowed ones are left alone. Large pages are never split.
    pub fn unmap_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        let Ok(Descent::Table(pt_page)) = self.descend::<A>(None, va, PageEntryBits::new()) else {
            return None;
        };

        let pt = self.table(pt_page);
        let index = TableLevel::Pt.index_of(va);
        let EntryKind::Leaf(frame, flags) = pt.kind(TableLevel::Pt, index) else {
            return None;
        };
        pt.set_kind(index, EntryKind::Empty);
        if !flags.borrowed() {
            alloc.free_4k(frame);
        }
        log::trace!("unmapped {va} (was {frame})");
        Some(frame)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.descend::<NoAlloc>(None, va, PageEntryBits::new()).ok()? {
            Descent::Large(pa) => Some(pa),
            Descent::Table(pt_page) => match self.table(pt_page).kind(TableLevel::Pt, TableLevel::Pt.index_of(va)) {
                EntryKind::Leaf(frame, _) => Some(frame.join(va.offset::<Size4K>())),
                _ => None,
            },
            Descent::Missing | Descent::Blocked => None,
        }
    }

    /// The raw leaf entry mapping `va`, if a page table holds one.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        match self.descend::<NoAlloc>(None, va, PageEntryBits::new()).ok()? {
            Descent::Table(pt_page) => {
                let entry = self.table(pt_page).get(TableLevel::Pt.index_of(va));
                (!entry.is_zero()).then_some(entry)
            }
            _ => None,
        }
    }

    /// Whether `va` is free, and how many bytes from `va` on share that answer.
    fn probe(&self, va: VirtualAddress) -> (bool, u64) {
        let mut page = self.root;
        let mut level = TableLevel::Pml4;
        loop {
            let span = level.span();
            let remaining = span - (va.as_u64() & (span - 1));
            match self.table(page).kind(level, level.index_of(va)) {
                EntryKind::Empty => return (true, remaining),
                EntryKind::NextLevel(next, _) => match level.next() {
                    Some(below) => {
                        page = next;
                        level = below;
                    }
                    None => return (false, remaining),
                },
                _ => return (false, remaining),
            }
        }
    }

    /// First address in `[start, end)` followed by at least `len` bytes of
    /// unmapped, page-aligned virtual memory.
    ///
    /// Empty upper-level entries are skipped whole; reserved entries count as
    /// occupied.
    #[must_use]
    pub fn find_free_range(
        &self,
        len: u64,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let need = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut va = start.align_up::<Size4K>()?;
        let mut run_start = va;
        let mut run_len = 0u64;

        while va < end {
            let (free, span) = self.probe(va);
            if free {
                if run_len == 0 {
                    run_start = va;
                }
                run_len += span;
                if run_len >= need {
                    return (run_start.as_u64() + need <= end.as_u64()).then_some(run_start);
                }
            } else {
                run_len = 0;
            }
            va = va.checked_add(span)?;
        }
        None
    }

    /// Build the identity window under [`IDENTITY_WINDOW_SLOT`]: one PDPT of
    /// 512 × 1 GiB large pages mapping physical `0..512 GiB`.
    ///
    /// Does nothing if the slot is already populated.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if the PDPT frame cannot be allocated.
    pub fn install_identity_window<A: FrameAlloc>(&self, alloc: &mut A) -> Result<(), VmemError> {
        let pml4 = self.table(self.root);
        if !pml4.get(IDENTITY_WINDOW_SLOT).is_zero() {
            return Ok(());
        }

        let pdpt_page = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        let pdpt = self.table(pdpt_page);
        for index in 0..ENTRIES_PER_TABLE {
            let base = PhysicalAddress::new(index as u64 * Size1G::SIZE);
            pdpt.set_kind(index, EntryKind::LargeLeaf(base, PageEntryBits::kernel_rw()));
        }
        pml4.set_kind(
            IDENTITY_WINDOW_SLOT,
            EntryKind::NextLevel(pdpt_page, PageEntryBits::kernel_rw()),
        );
        log::debug!("identity window installed with PDPT {pdpt_page}");
        Ok(())
    }
}

/// Stand-in allocator type for walks that never allocate.
enum NoAlloc {}

impl FrameAlloc for NoAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        match *self {}
    }

    fn free_4k(&mut self, _page: PhysicalPage<Size4K>) {
        match *self {}
    }
}

#[cfg(test)]
pub(crate) mod tests;
