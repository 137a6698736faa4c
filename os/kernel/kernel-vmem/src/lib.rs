//! # Virtual Memory Support
//!
//! Typed x86-64 paging for the kernel memory manager.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw 64-bit entry as a bitfield.
//! - [`EntryKind`]: the decoded entry, `Empty | NextLevel | Leaf | LargeLeaf | Reserved`.
//! - [`PageTable`] and [`TableLevel`]: a 512-entry table and the level it sits at.
//! - [`AddressSpace`]: one PML4-rooted tree with walk, map, unmap, query,
//!   free-range search, clone and destroy.
//! - The seams to the rest of the kernel: [`FrameAlloc`], [`PhysMapper`] and [`Tlb`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!            │        │
//!            │        └── PS=1 → 2 MiB page
//!            └─────────── PS=1 → 1 GiB page (identity window)
//! ```
//!
//! ## Reserved top-level slots
//!
//! | Slot | Use | On clone |
//! |------|-----|----------|
//! | 508 | MMIO window | shared |
//! | 509 | Identity window (512 × 1 GiB) | shared |
//! | 510 | Kernel image and heap | shared |
//! | 511 | Self-reference | points at the new root |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
mod page_table;
#[cfg(target_arch = "x86_64")]
pub mod tlb;

pub use crate::address_space::{AddressSpace, RootPage};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{EntryKind, PageTable, TableLevel};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Source of **physical** 4 KiB frames for page tables and leaf pages.
///
/// Returned frames **must** be 4 KiB aligned. `None` means out of memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB physical frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously handed out by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to pointers usable in the current address space.
///
/// - **Kernel**: adds the identity-window base.
/// - **Tests**: indexes into a buffer standing in for RAM.
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    ///
    /// # Safety
    /// - `pa` must lie in physical memory covered by this mapper.
    /// - The caller is responsible for not creating aliasing mutable accesses.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow the `T` stored at `pa`.
    ///
    /// # Safety
    /// - Same as [`phys_to_ptr`](Self::phys_to_ptr).
    /// - `pa` must be suitably aligned for `T`, and the bytes must be a valid `T`.
    /// - Lifetime `'a` is unchecked; the memory must stay valid for `'a`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}

/// Translation-cache and root-register hooks.
pub trait Tlb {
    /// Drop any cached translation for `page` on this CPU.
    fn invalidate_page(&self, page: VirtualPage<Size4K>);

    /// Make `root` the active address space.
    ///
    /// # Safety
    /// The new tree must map the currently executing code and stack.
    unsafe fn load_root(&self, root: RootPage);
}

/// Failures of the page-table layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmemError {
    #[error("no physical frame left for a page table or leaf")]
    OutOfFrames,
    #[error("a large page already maps {0}")]
    LargePageInTheWay(VirtualAddress),
    #[error("a reserved non-present entry covers {0}")]
    ReservedEntry(VirtualAddress),
}
