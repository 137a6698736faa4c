//! Runtime knobs of the memory manager.

use core::hint::spin_loop;
use core::ops::Range;
use kernel_info::memory::{
    KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_LENGTH, KERNEL_HEAP_RESERVE, RESERVED_LOW_END,
};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::YieldHook;

/// What to do when a frame or object is freed that is not currently allocated.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum FreePolicy {
    /// Ignore the free and log a warning.
    #[default]
    Lenient,
    /// Report [`MemoryError::InvalidFree`](crate::MemoryError::InvalidFree).
    Strict,
}

/// Settings for [`MemoryManager::init`](crate::MemoryManager::init).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// First byte of the kernel heap.
    pub heap_base: VirtualAddress,
    /// Heap bytes already in use by the time `init` runs.
    pub heap_initial_length: u64,
    /// Heap length established by `init`.
    pub heap_reserve: u64,
    /// Physical range that is never handed out (firmware, kernel image).
    pub reserved_low: Range<u64>,
    pub free_policy: FreePolicy,
    /// Build the identity window if the kernel root does not have one yet.
    pub install_identity_window: bool,
    /// Called by every memory-manager lock while it is contended.
    pub yield_hook: YieldHook,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            heap_initial_length: KERNEL_HEAP_INITIAL_LENGTH,
            heap_reserve: KERNEL_HEAP_RESERVE,
            reserved_low: 0..RESERVED_LOW_END,
            free_policy: FreePolicy::Lenient,
            install_identity_window: true,
            yield_hook: spin_loop,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub const fn with_free_policy(mut self, policy: FreePolicy) -> Self {
        self.free_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_yield_hook(mut self, hook: YieldHook) -> Self {
        self.yield_hook = hook;
        self
    }
}
