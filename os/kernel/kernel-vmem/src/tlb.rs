//! Hardware TLB maintenance for the running CPU.

use crate::{RootPage, Tlb};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};

/// [`Tlb`] backed by `invlpg` and `CR3`.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Tlb;

impl X86Tlb {
    /// The root of the address space currently loaded in `CR3`.
    #[inline]
    #[must_use]
    pub fn active_root() -> RootPage {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects in ring 0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(cr3))
    }
}

impl Tlb for X86Tlb {
    #[inline]
    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        // SAFETY: `invlpg` only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) page.base().as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    unsafe fn load_root(&self, root: RootPage) {
        let cr3 = root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
