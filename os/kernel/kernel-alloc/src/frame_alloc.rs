//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame: `1` = used, `0` = free. The bitmap storage is
//! handed in by the caller (typically a `static` of [`FRAME_BITMAP_WORDS`](kernel_info::memory::FRAME_BITMAP_WORDS)
//! words covering [`MAX_PHYS_FRAMES`](kernel_info::memory::MAX_PHYS_FRAMES)), so the allocator never needs a heap
//! and never carries the bitmap by value.
//!
//! Allocation scans from a cursor that remembers the last handed-out index and
//! wraps to zero at the end. Freeing a frame below the cursor moves the cursor
//! down, so recently released low frames are reused first.

use crate::{FreePolicy, MemoryError};
use core::ops::Range;
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{FrameIndex, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;

/// Frame counters reported by [`BitmapFrameAlloc::stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    pub capacity: usize,
    pub free: usize,
    pub used: usize,
}

/// Bitmap-backed allocator for 4 KiB physical frames.
pub struct BitmapFrameAlloc {
    bitmap: &'static mut [u64],
    capacity: usize,
    cursor: usize,
    policy: FreePolicy,
}

impl BitmapFrameAlloc {
    /// An allocator tracking one frame per bit of `bitmap`, all free.
    #[must_use]
    pub fn new(bitmap: &'static mut [u64], policy: FreePolicy) -> Self {
        let capacity = bitmap.len() * 64;
        Self::with_capacity(bitmap, capacity, policy)
    }

    /// An allocator tracking the first `capacity` frames, all free.
    ///
    /// `capacity` is clamped to the number of bits in `bitmap`.
    #[must_use]
    pub fn with_capacity(bitmap: &'static mut [u64], capacity: usize, policy: FreePolicy) -> Self {
        bitmap.fill(0);
        Self {
            capacity: capacity.min(bitmap.len() * 64),
            bitmap,
            cursor: 0,
            policy,
        }
    }

    /// Seed the bitmap from the boot memory map.
    ///
    /// Everything starts out used and `Available` regions are released. Every
    /// frame touching a non-`Available` region or one of `reserved` is then
    /// taken again, so firmware reservations win over overlapping RAM.
    pub fn init_from_memory_map(&mut self, regions: &[BootMemoryRegion], reserved: &[Range<u64>]) {
        self.bitmap.fill(u64::MAX);
        self.cursor = 0;

        let limit = self.capacity as u64 * PAGE_SIZE;
        for region in regions.iter().filter(|r| r.is_available() && !r.is_empty()) {
            if region.end > limit {
                log::warn!(
                    "ignoring RAM 0x{:X}..0x{:X} beyond the frame bitmap",
                    region.start.max(limit),
                    region.end
                );
            }
            self.mark_free(region.start..region.end);
        }
        for region in regions.iter().filter(|r| !r.is_available() && !r.is_empty()) {
            self.mark_used(region.start..region.end);
        }
        for range in reserved {
            self.mark_used(range.clone());
        }
        log::info!(
            "frame allocator seeded: {} of {} frames free",
            self.free_count(),
            self.capacity
        );
    }

    /// Mark every frame overlapping `range` (physical bytes) as used.
    pub fn mark_used(&mut self, range: Range<u64>) {
        let first = range.start / PAGE_SIZE;
        let end = range.end.div_ceil(PAGE_SIZE);
        for index in self.clip(first, end) {
            self.set(index);
        }
    }

    /// Mark every frame lying wholly inside `range` (physical bytes) as free.
    pub fn mark_free(&mut self, range: Range<u64>) {
        let first = range.start.div_ceil(PAGE_SIZE);
        let end = range.end / PAGE_SIZE;
        for index in self.clip(first, end) {
            self.clear(index);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn clip(&self, first: u64, end: u64) -> Range<usize> {
        let cap = self.capacity as u64;
        (first.min(cap) as usize)..(end.min(cap) as usize)
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`MemoryError::OutOfFrames`] after a full wrap without a free bit.
    pub fn alloc(&mut self) -> Result<PhysicalPage<Size4K>, MemoryError> {
        let index = self
            .find_free(self.cursor, self.capacity)
            .or_else(|| self.find_free(0, self.cursor))
            .ok_or(MemoryError::OutOfFrames)?;
        self.set(index);
        self.cursor = index;
        Ok(PhysicalPage::from_frame_index(FrameIndex::new(index as u64)))
    }

    /// Return `page` to the pool.
    ///
    /// # Errors
    /// [`MemoryError::InvalidFree`] in strict mode if the frame is out of range
    /// or already free. Lenient mode logs and carries on.
    pub fn free(&mut self, page: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        let index = page.frame_index().as_usize();
        if index >= self.capacity || !self.is_used(index) {
            return self.reject(page.base());
        }
        self.clear(index);
        if index < self.cursor {
            self.cursor = index;
        }
        Ok(())
    }

    fn reject(&self, pa: PhysicalAddress) -> Result<(), MemoryError> {
        match self.policy {
            FreePolicy::Lenient => {
                log::warn!("ignoring free of unallocated frame {pa}");
                Ok(())
            }
            FreePolicy::Strict => Err(MemoryError::InvalidFree(pa.as_u64())),
        }
    }

    /// First free index in `[from, to)`.
    fn find_free(&self, from: usize, to: usize) -> Option<usize> {
        let mut index = from;
        while index < to {
            let word = index / 64;
            let free = !self.bitmap[word] & (u64::MAX << (index % 64));
            if free != 0 {
                let found = word * 64 + free.trailing_zeros() as usize;
                return (found < to).then_some(found);
            }
            index = (word + 1) * 64;
        }
        None
    }

    /// Whether frame `index` is taken. Indices past the capacity are not.
    #[inline]
    #[must_use]
    pub const fn is_used(&self, index: usize) -> bool {
        index < self.capacity && self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    const fn set(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    const fn clear(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        let full_words = self.capacity / 64;
        let mut used: usize = self.bitmap[..full_words]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();
        let tail = self.capacity % 64;
        if tail != 0 {
            used += (self.bitmap[full_words] & ((1 << tail) - 1)).count_ones() as usize;
        }
        used
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity - self.used_count()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let used = self.used_count();
        FrameStats {
            capacity: self.capacity,
            free: self.capacity - used,
            used,
        }
    }

    /// Maximal runs of used frames, as physical byte ranges.
    #[must_use]
    pub const fn used_ranges(&self) -> UsedRanges<'_> {
        UsedRanges {
            frames: self,
            next: 0,
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc().ok()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Err(err) = self.free(page) {
            log::warn!("page table release: {err}");
        }
    }
}

/// Iterator returned by [`BitmapFrameAlloc::used_ranges`].
pub struct UsedRanges<'a> {
    frames: &'a BitmapFrameAlloc,
    next: usize,
}

impl Iterator for UsedRanges<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let cap = self.frames.capacity;
        let start = (self.next..cap).find(|&i| self.frames.is_used(i))?;
        let end = (start..cap).find(|&i| !self.frames.is_used(i)).unwrap_or(cap);
        self.next = end;
        Some(start as u64 * PAGE_SIZE..end as u64 * PAGE_SIZE)
    }
}

/// [`FrameAlloc`] view of a shared allocator; locks once per call.
pub struct LockedFrames<'a> {
    frames: &'a SpinLock<BitmapFrameAlloc>,
}

impl<'a> LockedFrames<'a> {
    #[must_use]
    pub const fn new(frames: &'a SpinLock<BitmapFrameAlloc>) -> Self {
        Self { frames }
    }
}

impl FrameAlloc for LockedFrames<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let page = self.frames.with_lock(BitmapFrameAlloc::alloc);
        if page.is_err() {
            log::warn!("physical frames exhausted");
        }
        page.ok()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.frames.with_lock(|f| f.free_4k(page));
    }
}
