//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The memory subsystem of the kernel: physical frames, page-table address
//! spaces, the kernel heap break and the `kmalloc` object allocator, behind a
//! single [`MemoryManager`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Slab Allocator                      │
//! │    • kmalloc / kfree / kcalloc                      │
//! │    • default and registered size classes            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ grows
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 Kernel Heap                         │
//! │    • one linear region, sbrk-style break            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ maps
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Virtual Memory Manager (VMM)              │
//! │    • map / unmap / MMIO / clone / destroy           │
//! │    • TLB maintenance                                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ allocates
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bit per 4 KiB frame                        │
//! │    • cursor with low-frame reuse                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables are reached through the identity window
//! ([`phys_mapper::IdentityPhysMapper`]); tests substitute fake RAM.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        User Space               │
//! USER_MMAP_BASE        │  (anonymous user mappings)      │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │        Non-canonical hole       │
//! MMIO_BASE        (508)├─────────────────────────────────┤
//!                       │   Device windows (uncached)     │
//! IDENTITY_BASE    (509)├─────────────────────────────────┤
//!                       │   All physical memory, 1 GiB    │
//! KERNEL_ENTRY     (510)├─────────────────────────────────┤
//!                       │   Kernel image, then the heap   │
//!                  (511)├─────────────────────────────────┤
//!                       │   Self-reference                │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Errors
//!
//! Every fallible operation returns [`MemoryError`]. Freeing something that is
//! not allocated is ignored with a warning or reported, depending on
//! [`FreePolicy`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod config;
mod error;
pub mod frame_alloc;
pub mod heap;
mod manager;
pub mod phys_mapper;
pub mod slab;
pub mod vmm;

pub use config::{FreePolicy, MemoryConfig};
pub use error::MemoryError;
pub use frame_alloc::FrameStats;
pub use manager::{MapTarget, MemoryManager, ProcessContext};
pub use slab::{ClassStats, SlabInfo};
