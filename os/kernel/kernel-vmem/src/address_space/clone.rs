//! Copying and tearing down whole trees.

use super::AddressSpace;
use crate::{EntryKind, FrameAlloc, PageEntryBits, PhysMapper, TableLevel, VmemError};
use kernel_info::memory::{ENTRIES_PER_TABLE, SELF_REFERENCE_SLOT, is_kernel_shared_slot};
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Whether a leaf with `flags` is owned by the space that maps it.
#[inline]
const fn owns_leaf(flags: PageEntryBits) -> bool {
    flags.user_access() && !flags.borrowed()
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Duplicate this address space.
    ///
    /// - Kernel-shared top-level slots are copied by value, so both trees
    ///   reference the same subtrees.
    /// - Private intermediate tables are duplicated.
    /// - Owned user leaves get a new frame with a byte-for-byte copy.
    /// - Supervisor and borrowed leaves, large pages and reserved entries are
    ///   copied by value.
    /// - The self-reference slot points at the new root.
    ///
    /// On failure every frame allocated so far is returned to `alloc` and
    /// `self` is left untouched.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] when the allocator runs dry.
    pub fn clone_space<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmemError> {
        let new_root = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        self.table(new_root).zero();

        let src = self.table(self.root);
        for slot in 0..ENTRIES_PER_TABLE {
            if slot == SELF_REFERENCE_SLOT {
                continue;
            }
            let entry = src.get(slot);
            if is_kernel_shared_slot(slot) {
                self.table(new_root).set(slot, entry);
                continue;
            }
            let copied = match entry.kind(TableLevel::Pml4) {
                EntryKind::Empty => continue,
                EntryKind::NextLevel(page, flags) => match self.clone_table(alloc, TableLevel::Pdpt, page) {
                    Ok(copy) => EntryKind::NextLevel(copy, flags).into_bits(),
                    Err(err) => {
                        self.release_table(alloc, TableLevel::Pml4, new_root);
                        log::warn!("address space clone rolled back: {err}");
                        return Err(err);
                    }
                },
                _ => entry,
            };
            self.table(new_root).set(slot, copied);
        }

        self.table(new_root).set_kind(
            SELF_REFERENCE_SLOT,
            EntryKind::NextLevel(new_root, PageEntryBits::kernel_rw()),
        );
        log::debug!("cloned address space {} into {new_root}", self.root);
        Ok(Self::from_root(self.mapper, new_root))
    }

    /// Duplicate the private table `page` of `level` and everything below it.
    fn clone_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        level: TableLevel,
        page: PhysicalPage<Size4K>,
    ) -> Result<PhysicalPage<Size4K>, VmemError> {
        let copy = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        self.table(copy).zero();

        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.table(page).get(index);
            let result = match entry.kind(level) {
                EntryKind::Empty => continue,
                EntryKind::NextLevel(child, flags) => match level.next() {
                    Some(below) => self
                        .clone_table(alloc, below, child)
                        .map(|c| EntryKind::NextLevel(c, flags).into_bits()),
                    None => Ok(entry),
                },
                EntryKind::Leaf(frame, flags) if owns_leaf(flags) => self
                    .copy_frame(alloc, frame)
                    .map(|f| EntryKind::Leaf(f, flags).into_bits()),
                EntryKind::Leaf(..) | EntryKind::LargeLeaf(..) | EntryKind::Reserved(_) => Ok(entry),
            };
            match result {
                Ok(bits) => self.table(copy).set(index, bits),
                Err(err) => {
                    self.release_table(alloc, level, copy);
                    return Err(err);
                }
            }
        }
        Ok(copy)
    }

    /// A fresh frame holding the same bytes as `frame`.
    fn copy_frame<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        frame: PhysicalPage<Size4K>,
    ) -> Result<PhysicalPage<Size4K>, VmemError> {
        let copy = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        let bytes = *self.frame_bytes(frame);
        *self.frame_bytes(copy) = bytes;
        Ok(copy)
    }

    /// Free `page` of `level` together with every owned frame below it.
    /// Kernel-shared and self-reference slots of a root are skipped.
    fn release_table<A: FrameAlloc>(&self, alloc: &mut A, level: TableLevel, page: PhysicalPage<Size4K>) {
        for index in 0..ENTRIES_PER_TABLE {
            if level == TableLevel::Pml4 && (is_kernel_shared_slot(index) || index == SELF_REFERENCE_SLOT) {
                continue;
            }
            match self.table(page).kind(level, index) {
                EntryKind::NextLevel(child, _) => {
                    if let Some(below) = level.next() {
                        self.release_table(alloc, below, child);
                    }
                }
                EntryKind::Leaf(frame, flags) if owns_leaf(flags) => alloc.free_4k(frame),
                _ => {}
            }
        }
        alloc.free_4k(page);
    }

    /// Release every frame this address space owns, the root included.
    ///
    /// Kernel-shared subtrees, supervisor and borrowed leaves, and large pages
    /// are left alone. The space must not be active on any CPU.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let root = self.root;
        self.release_table(alloc, TableLevel::Pml4, root);
        log::debug!("destroyed address space {root}");
    }
}
