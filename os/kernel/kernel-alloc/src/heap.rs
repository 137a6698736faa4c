//! # Kernel Heap Break
//!
//! The kernel heap is one linear region `[base, base + length)` in the kernel
//! window. It only grows and shrinks at the tail:
//!
//! ```text
//! base                      base + length (break)
//! ├──────── mapped ────────┤
//!                           grow(+n) maps up to here ──►
//!           ◄── grow(-n) unmaps whole pages past the new break
//! ```
//!
//! The slab allocator takes its pages from here.

use crate::MemoryError;
use kernel_memory_addresses::{Size4K, VirtualAddress};

/// Where the heap gets its pages from.
pub trait HeapBackend {
    /// Back `[start, start + len)` with memory. Already-mapped pages are kept.
    ///
    /// # Errors
    /// Whatever the backing store reports, typically [`MemoryError::OutOfFrames`].
    fn map_range(&self, start: VirtualAddress, len: u64) -> Result<(), MemoryError>;

    /// Release the pages of `[start, start + len)`.
    fn unmap_range(&self, start: VirtualAddress, len: u64);
}

/// The kernel heap cursor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelHeap {
    base: VirtualAddress,
    length: u64,
}

impl KernelHeap {
    /// A heap at `base` whose first `length` bytes are already in use.
    #[must_use]
    pub const fn new(base: VirtualAddress, length: u64) -> Self {
        Self { base, length }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// The current break, one past the last heap byte.
    #[inline]
    #[must_use]
    pub fn brk(&self) -> VirtualAddress {
        self.base + self.length
    }

    /// Move the break by `delta` bytes and return the previous break.
    ///
    /// Growing maps the whole heap from its base up to the new break; pages
    /// that are already present stay untouched. Shrinking unmaps only the
    /// pages lying wholly past the new break.
    ///
    /// # Errors
    /// - [`MemoryError::HeapUnderflow`] if the heap would shrink below its base.
    /// - [`MemoryError::OutOfWindow`] if the break would overflow.
    /// - Backend failures while growing; the length is unchanged then.
    pub fn grow(&mut self, delta: i64, backend: &impl HeapBackend) -> Result<VirtualAddress, MemoryError> {
        let old_brk = self.brk();
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            if magnitude == 0 {
                return Ok(old_brk);
            }
            let new_length = self
                .length
                .checked_add(magnitude)
                .filter(|len| self.base.checked_add(*len).is_some())
                .ok_or(MemoryError::OutOfWindow(old_brk.as_u64()))?;
            backend.map_range(self.base, new_length)?;
            self.length = new_length;
        } else {
            let new_length = self
                .length
                .checked_sub(magnitude)
                .ok_or(MemoryError::HeapUnderflow)?;
            let keep_end = (self.base + new_length)
                .align_up::<Size4K>()
                .ok_or(MemoryError::OutOfWindow(old_brk.as_u64()))?;
            let mapped_end = old_brk
                .align_up::<Size4K>()
                .ok_or(MemoryError::OutOfWindow(old_brk.as_u64()))?;
            if mapped_end > keep_end {
                backend.unmap_range(keep_end, mapped_end - keep_end);
            }
            self.length = new_length;
        }
        log::debug!("heap break {old_brk} -> {} ({delta:+})", self.brk());
        Ok(old_brk)
    }

    /// Move the break to `base + length`; returns the previous break.
    ///
    /// # Errors
    /// See [`grow`](Self::grow).
    pub fn set_length(&mut self, length: u64, backend: &impl HeapBackend) -> Result<VirtualAddress, MemoryError> {
        let delta = i64::try_from(i128::from(length) - i128::from(self.length))
            .map_err(|_| MemoryError::OutOfWindow(self.base.as_u64()))?;
        self.grow(delta, backend)
    }
}
