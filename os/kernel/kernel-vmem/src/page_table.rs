//! # Typed Page Tables
//!
//! A [`PageTable`] is one 4 KiB frame holding 512 [`PageEntryBits`]. The meaning
//! of an entry depends on the [`TableLevel`] it lives in, so raw entries are
//! only interpreted through [`PageEntryBits::kind`], which yields an
//! [`EntryKind`].

use crate::PageEntryBits;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// The four paging levels, top to bottom.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableLevel {
    /// Page Map Level 4 (root).
    Pml4,
    /// Page Directory Pointer Table; may hold 1 GiB leaves.
    Pdpt,
    /// Page Directory; may hold 2 MiB leaves.
    Pd,
    /// Page Table; holds 4 KiB leaves.
    Pt,
}

impl TableLevel {
    /// Bit position of this level's 9-bit index within a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry of this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Index into this level's table for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1ff) as usize
    }

    /// The level below, or `None` for [`TableLevel::Pt`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Whether entries with `PS=1` are leaves at this level.
    #[inline]
    #[must_use]
    pub const fn allows_large(self) -> bool {
        matches!(self, Self::Pdpt | Self::Pd)
    }
}

/// Decoded form of a page table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// All bits zero.
    Empty,
    /// Points to the table of the next level.
    NextLevel(PhysicalPage<Size4K>, PageEntryBits),
    /// A 4 KiB mapping in a page table.
    Leaf(PhysicalPage<Size4K>, PageEntryBits),
    /// A 1 GiB (PDPT) or 2 MiB (PD) mapping.
    LargeLeaf(PhysicalAddress, PageEntryBits),
    /// Not present but non-zero. Kept for markers such as stack guards;
    /// never walked into and never treated as free.
    Reserved(PageEntryBits),
}

impl EntryKind {
    /// Encode back into raw entry bits.
    #[must_use]
    pub const fn into_bits(self) -> PageEntryBits {
        match self {
            Self::Empty => PageEntryBits::new(),
            Self::NextLevel(page, flags) => flags
                .flags()
                .with_present(true)
                .with_large_page(false)
                .with_physical_address(page.base()),
            Self::Leaf(page, flags) => flags
                .flags()
                .with_present(true)
                .with_large_page(false)
                .with_physical_address(page.base()),
            Self::LargeLeaf(base, flags) => flags
                .flags()
                .with_present(true)
                .with_large_page(true)
                .with_physical_address(base),
            Self::Reserved(bits) => bits,
        }
    }
}

impl PageEntryBits {
    /// Interpret this entry as found in a table of `level`.
    #[must_use]
    pub const fn kind(self, level: TableLevel) -> EntryKind {
        if self.is_zero() {
            return EntryKind::Empty;
        }
        if !self.present() {
            return EntryKind::Reserved(self);
        }
        let flags = self.flags();
        match level {
            TableLevel::Pt => EntryKind::Leaf(self.frame(), flags),
            _ if level.allows_large() && self.large_page() => {
                EntryKind::LargeLeaf(self.physical_address(), flags)
            }
            _ => EntryKind::NextLevel(self.frame(), flags),
        }
    }
}

/// One 4 KiB-aligned page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Decode entry `index` as an entry of `level`.
    #[inline]
    #[must_use]
    pub const fn kind(&self, level: TableLevel, index: usize) -> EntryKind {
        self.entries[index].kind(level)
    }

    #[inline]
    pub const fn set_kind(&mut self, index: usize, kind: EntryKind) {
        self.entries[index] = kind.into_bits();
    }

    /// Number of non-zero entries.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_zero()).count()
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
