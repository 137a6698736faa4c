use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This models the **common superset** of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE). Whether an entry is a table pointer or a
/// leaf is decided by its level and the `large_page` bit; see
/// [`EntryKind`](crate::EntryKind) for the decoded form.
///
/// ### Bit layout
///
/// | Bits  | Name              | Meaning |
/// |-------|-------------------|---------|
/// | 0     | `P`               | Valid entry if set |
/// | 1     | `RW`              | Writable if set |
/// | 2     | `US`              | User-mode accessible if set |
/// | 3     | `PWT`             | Write-through caching |
/// | 4     | `PCD`             | Disable caching |
/// | 5     | `A`               | Accessed |
/// | 6     | `D`               | Dirty (leaf only) |
/// | 7     | `PS`              | Large page flag |
/// | 8     | `G`               | Global (leaf only) |
/// | 9     | borrowed          | OS: frame is not owned by this mapping |
/// | 10–11 | OS avail low      | Reserved for OS use |
/// | 12–51 | `addr`            | Physical frame bits [51:12] |
/// | 52–58 | OS avail high     | Reserved for OS use |
/// | 59–62 | `PKU`             | Protection key or OS use |
/// | 63    | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0x12_3000));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Set on every MMIO mapping.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Valid in PDPTEs (1 GiB leaf) and PDEs (2 MiB leaf). Must be clear in
    /// PML4Es and PTEs.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    /// Borrowed frame (OS-available bit 9).
    ///
    /// The leaf maps a frame this address space does not own (device memory,
    /// a frame supplied by the caller). Unmapping or destroying the space
    /// leaves such frames alone, and cloning shares them instead of copying.
    pub borrowed: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The 4 KiB frame this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.physical_address())
    }

    /// The same permission and caching bits, with the address cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        self.with_phys_addr_bits_51_12(0)
    }

    /// An all-zero entry.
    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.into_bits() == 0
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// Writable, uncached device memory; user-accessible if `user` is set.
    #[inline]
    #[must_use]
    pub const fn mmio(user: bool) -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_user_access(user)
            .with_borrowed(true)
    }

    /// Flags for an intermediate table created on behalf of a leaf with
    /// `leaf` flags: present and writable, user-accessible if the leaf is.
    #[inline]
    #[must_use]
    pub const fn table_for(leaf: Self) -> Self {
        Self::kernel_rw().with_user_access(leaf.user_access())
    }
}

const _: () = {
    assert!(PageEntryBits::new().with_present(true).into_bits() == 1);
    assert!(PageEntryBits::new().with_writable(true).into_bits() == 2);
    assert!(PageEntryBits::new().with_user_access(true).into_bits() == 4);
    assert!(PageEntryBits::new().with_cache_disabled(true).into_bits() == 1 << 4);
    assert!(PageEntryBits::new().with_large_page(true).into_bits() == 1 << 7);
    assert!(PageEntryBits::new().with_borrowed(true).into_bits() == 1 << 9);
    assert!(PageEntryBits::new().with_no_execute(true).into_bits() == 1 << 63);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_does_not_clobber_flags() {
        let e = PageEntryBits::user_rw()
            .with_no_execute(true)
            .with_physical_address(PhysicalAddress::new(0x000f_ffff_ffff_f000));
        assert!(e.present() && e.writable() && e.user_access() && e.no_execute());
        assert_eq!(e.physical_address().as_u64(), 0x000f_ffff_ffff_f000);
        assert_eq!(e.flags(), PageEntryBits::user_rw().with_no_execute(true));
    }

    #[test]
    fn mmio_flags_are_uncached_and_borrowed() {
        let k = PageEntryBits::mmio(false);
        assert!(k.cache_disabled() && k.writable() && k.borrowed() && !k.user_access());
        assert!(PageEntryBits::mmio(true).user_access());
    }
}
