//! # Kernel Memory Layout and Boot Interface
//!
//! The authoritative source for the virtual memory layout shared by every
//! memory-management crate, and for the shape of the physical memory map the
//! bootloader passes in.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Reserved PML4 slots**: the MMIO window (508), the identity window (509),
//!   the kernel window (510) and the self-reference slot (511).
//! * **Identity arithmetic**: [`memory::translate_to_physical`] and
//!   [`memory::translate_to_kernel_virtual`].
//! * **Heap and bitmap sizing**: kernel heap base, initial length, reserve, and
//!   the capacity of the physical frame bitmap.
//!
//! ### Boot Memory Map ([`boot`])
//! * [`BootMemoryRegion`](boot::BootMemoryRegion) `[start, end)` ranges tagged
//!   with a [`BootMemoryKind`](boot::BootMemoryKind).
//!
//! All layout constants are checked with compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
