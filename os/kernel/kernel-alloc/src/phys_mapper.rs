//! # Identity-Window Physical Mapper
//!
//! Every address space maps all physical memory 1:1 at
//! [`IDENTITY_BASE`](kernel_info::memory::IDENTITY_BASE) using 1 GiB pages, so
//! the kernel reaches any frame by OR-ing the window base into its address.
//! No temporary mappings are ever needed.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::IdentityPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let ptr = unsafe { IdentityPhysMapper.phys_to_ptr(PhysicalAddress::new(0x1234_5000)) };
//! assert_eq!(ptr as u64, 0xffff_fe80_1234_5000);
//! ```

use kernel_info::memory::translate_to_kernel_virtual;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] through the identity window.
///
/// # Safety
/// Only valid once the identity window is installed in the active address space.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[inline]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        translate_to_kernel_virtual(pa).as_mut_ptr()
    }
}
