//! # Slab Allocator
//!
//! Fixed-size object classes carved from kernel heap pages.
//!
//! ## Layout
//!
//! Every slab is described by a 40-byte [`SlabRecord`] that lives on the heap
//! itself, inside the 40-byte *record class*:
//!
//! ```text
//! record ──► base ──► ┌──────┬──────┬──────┬─────┐
//!                     │ obj0 │ obj1 │ obj2 │ ... │   span = max(4 KiB, size rounded to pages)
//!                     └──────┴──────┴──────┴─────┘
//!            bitmap ─► one bit per object, 1 = used
//!            next ───► record of the next slab of the same class
//! ```
//!
//! - A bitmap of at most 40 bytes is itself an object of the record class.
//! - Larger bitmaps occupy the leading objects of their own slab.
//! - Slabs of the record class hold their own record and bitmap in objects 0
//!   and 1, so growing the record class never needs another record.
//!
//! ## Bootstrap
//!
//! The first heap page is split in two halves:
//!
//! ```text
//! 0        40       80                     2040 2048                    4096
//! ├ record ┼ bitmap ┼── 49 free 40-byte objects ┤ 256 objects of 8 bytes ┤
//! ```
//!
//! The 8-byte class gets its record and its 4-word bitmap from the record
//! class, after which all remaining default classes are created normally.
//!
//! Slabs are never released; emptied slabs are reused.

#![allow(clippy::cast_possible_truncation)]

use crate::{FreePolicy, MemoryError};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, align_up};

/// Size of a [`SlabRecord`] and of the objects of the record class.
pub const RECORD_SIZE: u64 = 40;

/// Object sizes of the built-in classes, smallest first.
pub const DEFAULT_CLASS_SIZES: [u32; 13] = [8, 16, 32, 40, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384];

/// Number of classes [`SlabAllocator::register_size_class`] can add.
pub const DYNAMIC_CLASS_CAPACITY: usize = 32;

const RECORD_CLASS: usize = 3;
const BYTE_CLASS: usize = 0;
const BOOTSTRAP_SPLIT: u64 = PAGE_SIZE / 2;

const _: () = {
    assert!(DEFAULT_CLASS_SIZES[RECORD_CLASS] as u64 == RECORD_SIZE);
    assert!(DEFAULT_CLASS_SIZES[BYTE_CLASS] == 8);
    assert!(size_of::<SlabRecord>() as u64 == RECORD_SIZE);
};

/// Heap access for the slab allocator.
pub trait SlabBackend {
    /// Extend the kernel heap by `bytes` and return the page-aligned start of
    /// the new region.
    ///
    /// # Errors
    /// Typically [`MemoryError::OutOfFrames`].
    fn grow_heap(&mut self, bytes: u64) -> Result<VirtualAddress, MemoryError>;

    /// Pointer through which the heap byte at `va` can be read and written.
    /// Valid up to the end of the 4 KiB page containing `va`.
    ///
    /// # Errors
    /// [`MemoryError::Unmapped`] if `va` is not backed.
    fn heap_ptr(&self, va: VirtualAddress) -> Result<*mut u8, MemoryError>;
}

/// Bookkeeping for one slab, stored on the heap.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
struct SlabRecord {
    base: u64,
    bitmap: u64,
    next: u64,
    object_size: u32,
    total_objects: u32,
    free_objects: u32,
    bitmap_words: u32,
}

impl SlabRecord {
    const fn end(&self) -> u64 {
        self.base + self.total_objects as u64 * self.object_size as u64
    }

    /// Objects at the start of the slab that hold the allocator's own
    /// bookkeeping: the record and bitmap of a record-class slab, or a bitmap
    /// too large for the record class.
    const fn leading_objects(&self) -> u64 {
        let size = self.object_size as u64;
        if size == RECORD_SIZE {
            2
        } else if self.bitmap == self.base {
            (self.bitmap_words as u64 * 8).div_ceil(size)
        } else {
            0
        }
    }
}

/// A size paired with the head of its slab chain; `size == 0` is an empty slot.
#[derive(Debug, Default, Copy, Clone)]
struct SizeClass {
    size: u32,
    head: u64,
}

/// Snapshot of one slab.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlabInfo {
    pub base: VirtualAddress,
    pub object_size: u32,
    pub total_objects: u32,
    pub free_objects: u32,
    /// Number of set bits in the slab's bitmap.
    pub used_bits: u32,
}

/// Totals of one size class.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ClassStats {
    pub object_size: u32,
    pub slabs: usize,
    pub total_objects: u64,
    pub free_objects: u64,
}

#[derive(Debug, Copy, Clone)]
enum ClassRef {
    Default(usize),
    Dynamic(usize),
}

/// Bytes covered by one slab of `size`-byte objects.
const fn slab_span(size: u64) -> u64 {
    match align_up(size, PAGE_SIZE) {
        Some(span) if span > PAGE_SIZE => span,
        _ => PAGE_SIZE,
    }
}

/// Bitmap length in words for `objects` objects. More than one word's worth
/// beyond 512 objects is rounded up to a multiple of 8 words.
const fn bitmap_words(objects: u64) -> u64 {
    let words = objects.div_ceil(64);
    if objects > 512 { words.next_multiple_of(8) } else { words }
}

fn load<B: SlabBackend>(backend: &B, at: u64) -> Result<SlabRecord, MemoryError> {
    let ptr = backend.heap_ptr(VirtualAddress::new(at))?;
    // SAFETY: records are written by `store` at addresses handed out by the record class.
    Ok(unsafe { ptr.cast::<SlabRecord>().read_unaligned() })
}

fn store<B: SlabBackend>(backend: &B, at: u64, record: &SlabRecord) -> Result<(), MemoryError> {
    let ptr = backend.heap_ptr(VirtualAddress::new(at))?;
    // SAFETY: `at` is a record-class object, which never straddles a page.
    unsafe { ptr.cast::<SlabRecord>().write_unaligned(*record) };
    Ok(())
}

fn load_word<B: SlabBackend>(backend: &B, at: u64) -> Result<u64, MemoryError> {
    let ptr = backend.heap_ptr(VirtualAddress::new(at))?;
    // SAFETY: bitmap words are 8-byte aligned inside a single page.
    Ok(unsafe { ptr.cast::<u64>().read_unaligned() })
}

fn store_word<B: SlabBackend>(backend: &B, at: u64, word: u64) -> Result<(), MemoryError> {
    let ptr = backend.heap_ptr(VirtualAddress::new(at))?;
    // SAFETY: see `load_word`.
    unsafe { ptr.cast::<u64>().write_unaligned(word) };
    Ok(())
}

/// The kmalloc/kfree object allocator.
pub struct SlabAllocator {
    defaults: [SizeClass; DEFAULT_CLASS_SIZES.len()],
    dynamic: [SizeClass; DYNAMIC_CLASS_CAPACITY],
    policy: FreePolicy,
}

impl SlabAllocator {
    /// An allocator with the default classes declared but no slabs yet.
    #[must_use]
    pub const fn new(policy: FreePolicy) -> Self {
        let mut defaults = [SizeClass { size: 0, head: 0 }; DEFAULT_CLASS_SIZES.len()];
        let mut i = 0;
        while i < defaults.len() {
            defaults[i].size = DEFAULT_CLASS_SIZES[i];
            i += 1;
        }
        Self {
            defaults,
            dynamic: [SizeClass { size: 0, head: 0 }; DYNAMIC_CLASS_CAPACITY],
            policy,
        }
    }

    #[must_use]
    pub const fn is_bootstrapped(&self) -> bool {
        self.defaults[RECORD_CLASS].head != 0
    }

    const fn class(&self, class: ClassRef) -> &SizeClass {
        match class {
            ClassRef::Default(i) => &self.defaults[i],
            ClassRef::Dynamic(i) => &self.dynamic[i],
        }
    }

    const fn class_mut(&mut self, class: ClassRef) -> &mut SizeClass {
        match class {
            ClassRef::Default(i) => &mut self.defaults[i],
            ClassRef::Dynamic(i) => &mut self.dynamic[i],
        }
    }

    /// Exact match among registered classes, else the smallest default class
    /// that fits.
    fn select(&self, size: usize) -> Option<ClassRef> {
        self.dynamic
            .iter()
            .position(|c| c.size != 0 && c.size as usize == size)
            .map(ClassRef::Dynamic)
            .or_else(|| {
                self.defaults
                    .iter()
                    .position(|c| c.size as usize >= size)
                    .map(ClassRef::Default)
            })
    }

    /// Exact match, registered classes first.
    fn lookup(&self, size: usize) -> Option<ClassRef> {
        self.dynamic
            .iter()
            .position(|c| c.size != 0 && c.size as usize == size)
            .map(ClassRef::Dynamic)
            .or_else(|| {
                self.defaults
                    .iter()
                    .position(|c| c.size as usize == size)
                    .map(ClassRef::Default)
            })
    }

    /// Build the record class and the 8-byte class in the first heap page,
    /// then create every other default class.
    ///
    /// # Errors
    /// Heap growth failures.
    pub fn bootstrap<B: SlabBackend>(&mut self, backend: &mut B) -> Result<(), MemoryError> {
        if self.is_bootstrapped() {
            return Ok(());
        }

        let page = backend.grow_heap(PAGE_SIZE)?.as_u64();
        let records = BOOTSTRAP_SPLIT / RECORD_SIZE;
        let record_class = SlabRecord {
            base: page,
            bitmap: page + RECORD_SIZE,
            next: 0,
            object_size: DEFAULT_CLASS_SIZES[RECORD_CLASS],
            total_objects: records as u32,
            free_objects: records as u32 - 2,
            bitmap_words: bitmap_words(records) as u32,
        };
        Self::format(backend, page, &record_class, 2)?;
        self.defaults[RECORD_CLASS].head = page;

        let bytes = BOOTSTRAP_SPLIT / 8;
        let record_at = self.alloc_record(backend)?;
        let bitmap_at = self.alloc_record(backend)?;
        let byte_class = SlabRecord {
            base: page + BOOTSTRAP_SPLIT,
            bitmap: bitmap_at,
            next: 0,
            object_size: DEFAULT_CLASS_SIZES[BYTE_CLASS],
            total_objects: bytes as u32,
            free_objects: bytes as u32,
            bitmap_words: bitmap_words(bytes) as u32,
        };
        Self::format(backend, record_at, &byte_class, 0)?;
        self.defaults[BYTE_CLASS].head = record_at;

        for index in 0..self.defaults.len() {
            if self.defaults[index].head == 0 {
                self.defaults[index].head = self.create_slab(self.defaults[index].size, backend)?;
            }
        }
        log::info!("slab allocator bootstrapped at 0x{page:016X}");
        Ok(())
    }

    /// Add a class for objects of exactly `size` bytes and give it its first
    /// slab. Registering a size twice is a no-op.
    ///
    /// # Errors
    /// - [`MemoryError::NoSizeClass`] for zero or absurd sizes.
    /// - [`MemoryError::ClassTableFull`] if every dynamic slot is taken.
    /// - Heap growth failures.
    pub fn register_size_class<B: SlabBackend>(&mut self, size: usize, backend: &mut B) -> Result<(), MemoryError> {
        let object_size = u32::try_from(size)
            .ok()
            .filter(|&s| s != 0)
            .ok_or(MemoryError::NoSizeClass(size))?;
        if self.dynamic.iter().any(|c| c.size == object_size) {
            return Ok(());
        }
        let slot = self
            .dynamic
            .iter()
            .position(|c| c.size == 0)
            .ok_or(MemoryError::ClassTableFull)?;
        let head = self.create_slab(object_size, backend)?;
        self.dynamic[slot] = SizeClass { size: object_size, head };
        log::debug!("registered size class {size} in slot {slot}");
        Ok(())
    }

    /// Allocate an object of at least `size` bytes.
    ///
    /// # Errors
    /// - [`MemoryError::NoSizeClass`] if no class is large enough.
    /// - Heap growth failures when a new slab is needed.
    pub fn kmalloc<B: SlabBackend>(&mut self, size: usize, backend: &mut B) -> Result<VirtualAddress, MemoryError> {
        let class = self.select(size).ok_or(MemoryError::NoSizeClass(size))?;
        let va = self.alloc_in(class, backend)?;
        log::trace!("kmalloc({size}) = {va}");
        Ok(va)
    }

    /// [`kmalloc`](Self::kmalloc) of `count * size` bytes, zero-filled.
    ///
    /// # Errors
    /// As [`kmalloc`](Self::kmalloc); an overflowing product is
    /// [`MemoryError::NoSizeClass`].
    pub fn kcalloc<B: SlabBackend>(
        &mut self,
        count: usize,
        size: usize,
        backend: &mut B,
    ) -> Result<VirtualAddress, MemoryError> {
        let total = count
            .checked_mul(size)
            .ok_or(MemoryError::NoSizeClass(usize::MAX))?;
        let va = self.kmalloc(total, backend)?;

        let mut at = va.as_u64();
        let end = at + total as u64;
        while at < end {
            let chunk = (end - at).min(PAGE_SIZE - at % PAGE_SIZE);
            let ptr = backend.heap_ptr(VirtualAddress::new(at))?;
            // SAFETY: the object is ours and `chunk` stays within one page.
            unsafe { ptr.write_bytes(0, chunk as usize) };
            at += chunk;
        }
        Ok(va)
    }

    /// Return the object at `ptr` to its slab.
    ///
    /// # Errors
    /// [`MemoryError::InvalidFree`] in strict mode when `ptr` is not the start
    /// of an allocated object.
    pub fn kfree<B: SlabBackend>(&mut self, ptr: VirtualAddress, backend: &mut B) -> Result<(), MemoryError> {
        let addr = ptr.as_u64();
        for class in self.defaults.iter().chain(self.dynamic.iter()) {
            let mut at = class.head;
            while at != 0 {
                let mut record = load(backend, at)?;
                if (record.base..record.end()).contains(&addr) {
                    let size = u64::from(record.object_size);
                    let offset = addr - record.base;
                    if offset % size != 0 {
                        return self.reject(ptr);
                    }
                    let index = offset / size;
                    if index < record.leading_objects() {
                        return self.reject(ptr);
                    }
                    let word_at = record.bitmap + (index / 64) * 8;
                    let word = load_word(backend, word_at)?;
                    let mask = 1u64 << (index % 64);
                    if word & mask == 0 {
                        return self.reject(ptr);
                    }
                    store_word(backend, word_at, word & !mask)?;
                    record.free_objects += 1;
                    store(backend, at, &record)?;
                    log::trace!("kfree({ptr})");
                    return Ok(());
                }
                at = record.next;
            }
        }
        self.reject(ptr)
    }

    fn reject(&self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        match self.policy {
            FreePolicy::Lenient => {
                log::warn!("ignoring kfree of unknown object {ptr}");
                Ok(())
            }
            FreePolicy::Strict => Err(MemoryError::InvalidFree(ptr.as_u64())),
        }
    }

    fn alloc_record<B: SlabBackend>(&mut self, backend: &mut B) -> Result<u64, MemoryError> {
        self.alloc_in(ClassRef::Default(RECORD_CLASS), backend)
            .map(VirtualAddress::as_u64)
    }

    /// First free object of `class`, appending a slab if the chain is full.
    fn alloc_in<B: SlabBackend>(&mut self, class: ClassRef, backend: &mut B) -> Result<VirtualAddress, MemoryError> {
        let mut tail = 0;
        let mut at = self.class(class).head;
        while at != 0 {
            let mut record = load(backend, at)?;
            if record.free_objects > 0 {
                if let Some(va) = Self::claim(&mut record, backend)? {
                    store(backend, at, &record)?;
                    return Ok(va);
                }
            }
            tail = at;
            at = record.next;
        }

        let size = self.class(class).size;
        let fresh = self.create_slab(size, backend)?;
        if tail == 0 {
            self.class_mut(class).head = fresh;
        } else {
            let mut last = load(backend, tail)?;
            last.next = fresh;
            store(backend, tail, &last)?;
        }

        let mut record = load(backend, fresh)?;
        let va = Self::claim(&mut record, backend)?.ok_or(MemoryError::NoSizeClass(size as usize))?;
        store(backend, fresh, &record)?;
        Ok(va)
    }

    /// Mark the lowest free object of `record` used.
    fn claim<B: SlabBackend>(record: &mut SlabRecord, backend: &B) -> Result<Option<VirtualAddress>, MemoryError> {
        for w in 0..u64::from(record.bitmap_words) {
            let word_at = record.bitmap + w * 8;
            let word = load_word(backend, word_at)?;
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros();
            let index = w * 64 + u64::from(bit);
            if index >= u64::from(record.total_objects) {
                break;
            }
            store_word(backend, word_at, word | (1 << bit))?;
            record.free_objects -= 1;
            return Ok(Some(VirtualAddress::new(record.base + index * u64::from(record.object_size))));
        }
        Ok(None)
    }

    /// Carve a new slab for `size`-byte objects and return its record address.
    fn create_slab<B: SlabBackend>(&mut self, size: u32, backend: &mut B) -> Result<u64, MemoryError> {
        let object_size = u64::from(size);
        let span = slab_span(object_size);
        let objects = span / object_size;
        let words = bitmap_words(objects);
        let base = backend.grow_heap(span)?.as_u64();

        let (record_at, bitmap_at, leading) = if object_size == RECORD_SIZE {
            (base, base + RECORD_SIZE, 2)
        } else {
            let record_at = self.alloc_record(backend)?;
            if words * 8 <= RECORD_SIZE {
                (record_at, self.alloc_record(backend)?, 0)
            } else {
                (record_at, base, (words * 8).div_ceil(object_size))
            }
        };

        let record = SlabRecord {
            base,
            bitmap: bitmap_at,
            next: 0,
            object_size: size,
            total_objects: objects as u32,
            free_objects: (objects - leading) as u32,
            bitmap_words: words as u32,
        };
        Self::format(backend, record_at, &record, leading)?;
        log::debug!(
            "new slab for {size}-byte objects at 0x{base:016X}: {objects} objects, {words} bitmap word(s)"
        );
        Ok(record_at)
    }

    /// Write `record` at `at` and initialise its bitmap with the first
    /// `leading` objects marked used.
    fn format<B: SlabBackend>(backend: &B, at: u64, record: &SlabRecord, leading: u64) -> Result<(), MemoryError> {
        for w in 0..u64::from(record.bitmap_words) {
            let taken = leading.saturating_sub(w * 64).min(64);
            let word = if taken == 64 { u64::MAX } else { (1 << taken) - 1 };
            store_word(backend, record.bitmap + w * 8, word)?;
        }
        store(backend, at, record)
    }

    /// Visit every slab of the class with exactly `size`-byte objects.
    ///
    /// # Errors
    /// Heap access failures.
    pub fn for_each_slab<B: SlabBackend>(
        &self,
        size: usize,
        backend: &B,
        mut f: impl FnMut(SlabInfo),
    ) -> Result<(), MemoryError> {
        let Some(class) = self.lookup(size) else {
            return Ok(());
        };
        let mut at = self.class(class).head;
        while at != 0 {
            let record = load(backend, at)?;
            let mut used_bits = 0;
            for w in 0..u64::from(record.bitmap_words) {
                let valid = u64::from(record.total_objects).saturating_sub(w * 64).min(64);
                let mask = if valid == 64 { u64::MAX } else { (1 << valid) - 1 };
                used_bits += (load_word(backend, record.bitmap + w * 8)? & mask).count_ones();
            }
            f(SlabInfo {
                base: VirtualAddress::new(record.base),
                object_size: record.object_size,
                total_objects: record.total_objects,
                free_objects: record.free_objects,
                used_bits,
            });
            at = record.next;
        }
        Ok(())
    }

    /// Totals for the class with exactly `size`-byte objects, if there is one.
    ///
    /// # Errors
    /// Heap access failures.
    pub fn class_stats<B: SlabBackend>(&self, size: usize, backend: &B) -> Result<Option<ClassStats>, MemoryError> {
        let Some(class) = self.lookup(size) else {
            return Ok(None);
        };
        let mut stats = ClassStats {
            object_size: self.class(class).size,
            ..ClassStats::default()
        };
        self.for_each_slab(size, backend, |slab| {
            stats.slabs += 1;
            stats.total_objects += u64::from(slab.total_objects);
            stats.free_objects += u64::from(slab.free_objects);
        })?;
        Ok(Some(stats))
    }

    /// Object sizes of every populated class, defaults first.
    pub fn class_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.defaults
            .iter()
            .chain(self.dynamic.iter())
            .filter(|c| c.size != 0)
            .map(|c| c.size)
    }
}
