//! # Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User Space (mmap from 4 MiB)   │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │        Non-canonical hole       │
//! MMIO_BASE             ├─────────────────────────────────┤ 0xffff_fe00_0000_0000  PML4[508]
//!                       │  MMIO window (uncached)         │
//! IDENTITY_BASE         ├─────────────────────────────────┤ 0xffff_fe80_0000_0000  PML4[509]
//!                       │  Identity window, 512 × 1 GiB   │
//! KERNEL_ENTRY          ├─────────────────────────────────┤ 0xffff_ff00_0000_0000  PML4[510]
//!                       │  Kernel image, kernel heap      │
//!                       ├─────────────────────────────────┤ 0xffff_ff80_0000_0000  PML4[511]
//!                       │  Self-reference                 │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Size of a physical frame and of a base page.
pub const PAGE_SIZE: u64 = 4096;

/// Number of entries in every page-table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Bytes covered by a single top-level (PML4) entry: 512 GiB.
pub const PML4_SLOT_SPAN: u64 = 1 << 39;

/// End of the lower canonical half; user mappings live below.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address handed out when the kernel picks a user mapping address.
pub const USER_MMAP_BASE: u64 = 0x0040_0000;

/// PML4 slot of the MMIO window.
pub const MMIO_WINDOW_SLOT: usize = 508;

/// Base of the uncached MMIO window. A device at physical `pa` is mapped
/// at `MMIO_BASE + pa`.
pub const MMIO_BASE: u64 = 0xffff_fe00_0000_0000;

/// PML4 slot of the identity window.
pub const IDENTITY_WINDOW_SLOT: usize = 509;

/// Base of the identity window. Physical address `pa` is visible at
/// `IDENTITY_BASE | pa`.
pub const IDENTITY_BASE: u64 = 0xffff_fe80_0000_0000;

/// Mask extracting the physical address from an identity-window address.
pub const IDENTITY_MASK: u64 = PML4_SLOT_SPAN - 1;

/// PML4 slot holding the kernel image and the kernel heap.
pub const KERNEL_WINDOW_SLOT: usize = 510;

/// Where the kernel executes.
pub const KERNEL_ENTRY: u64 = 0xffff_ff00_0000_0000;

/// PML4 slot pointing back at the PML4 itself.
pub const SELF_REFERENCE_SLOT: usize = 511;

/// First of the PML4 slots shared verbatim by every address space.
pub const FIRST_KERNEL_SHARED_SLOT: usize = MMIO_WINDOW_SLOT;

/// Last of the PML4 slots shared verbatim by every address space.
pub const LAST_KERNEL_SHARED_SLOT: usize = KERNEL_WINDOW_SLOT;

/// End of the low physical range reserved for firmware and the kernel image.
pub const RESERVED_LOW_END: u64 = 0x0040_1000;

/// Start of the kernel heap, right after the space reserved for the image.
pub const KERNEL_HEAP_BASE: u64 = KERNEL_ENTRY + RESERVED_LOW_END;

/// Heap length accounted to the image gap before the first `sbrk`.
pub const KERNEL_HEAP_INITIAL_LENGTH: u64 = 0x1000;

/// Heap length established during memory manager initialization.
pub const KERNEL_HEAP_RESERVE: u64 = 0x20_0000;

/// Number of physical frames the frame bitmap can track (2 GiB of RAM).
pub const MAX_PHYS_FRAMES: usize = 524_288;

/// Number of 64-bit words in the frame bitmap.
pub const FRAME_BITMAP_WORDS: usize = MAX_PHYS_FRAMES / 64;

/// Whether `slot` is one of the top-level entries every address space shares.
#[inline]
#[must_use]
pub const fn is_kernel_shared_slot(slot: usize) -> bool {
    slot >= FIRST_KERNEL_SHARED_SLOT && slot <= LAST_KERNEL_SHARED_SLOT
}

/// Physical address behind an identity-window address.
///
/// Pure arithmetic; valid because the window never changes after boot.
#[inline]
#[must_use]
pub const fn translate_to_physical(va: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress::new(va.as_u64() & IDENTITY_MASK)
}

/// Identity-window address of a physical address.
#[inline]
#[must_use]
pub const fn translate_to_kernel_virtual(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(pa.as_u64() | IDENTITY_BASE)
}

/// Canonical base address of PML4 `slot`.
#[inline]
#[must_use]
pub const fn slot_base(slot: usize) -> u64 {
    let base = (slot as u64 & 0x1ff) << 39;
    if base & (1 << 47) == 0 {
        base
    } else {
        base | 0xffff_0000_0000_0000
    }
}

/// Top-level slot an address falls into.
const fn pml4_slot(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}

const _: () = {
    assert!(pml4_slot(MMIO_BASE) == MMIO_WINDOW_SLOT);
    assert!(pml4_slot(IDENTITY_BASE) == IDENTITY_WINDOW_SLOT);
    assert!(pml4_slot(KERNEL_ENTRY) == KERNEL_WINDOW_SLOT);
    assert!(slot_base(MMIO_WINDOW_SLOT) == MMIO_BASE);
    assert!(slot_base(IDENTITY_WINDOW_SLOT) == IDENTITY_BASE);
    assert!(slot_base(KERNEL_WINDOW_SLOT) == KERNEL_ENTRY);
    assert!(pml4_slot(KERNEL_HEAP_BASE) == KERNEL_WINDOW_SLOT);
    assert!(IDENTITY_BASE & IDENTITY_MASK == 0);
    assert!(MMIO_BASE & IDENTITY_MASK == 0);
    assert!(KERNEL_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_INITIAL_LENGTH.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_RESERVE >= KERNEL_HEAP_INITIAL_LENGTH);
    assert!(MAX_PHYS_FRAMES.is_multiple_of(64));
    assert!(USER_MMAP_BASE < USERSPACE_END);
};
