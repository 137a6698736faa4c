//! # Memory Manager
//!
//! The single object the rest of the kernel talks to. It owns the frame
//! bitmap, the page-table lock, the heap break and the slab allocator, and
//! takes its locks in one fixed order:
//!
//! ```text
//! slab ──► heap ──► page tables ──► frames
//! ```
//!
//! Nothing here allocates from the heap it manages; slab records live in the
//! heap pages themselves and are reached through the [`PhysMapper`].

use crate::frame_alloc::{BitmapFrameAlloc, FrameStats};
use crate::heap::{HeapBackend, KernelHeap};
use crate::slab::{ClassStats, SlabAllocator, SlabBackend, SlabInfo};
use crate::vmm::Vmm;
use crate::{MemoryConfig, MemoryError};
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::{
    KERNEL_WINDOW_SLOT, MMIO_BASE, MMIO_WINDOW_SLOT, PAGE_SIZE, PML4_SLOT_SPAN, USER_MMAP_BASE,
    USERSPACE_END,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{PageEntryBits, PhysMapper, RootPage, Tlb};

/// Tells the memory manager which address space is currently active.
pub trait ProcessContext {
    fn current_root(&self) -> RootPage;
}

impl<F: Fn() -> RootPage> ProcessContext for F {
    fn current_root(&self) -> RootPage {
        self()
    }
}

/// Which half of the address space a mapping belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapTarget {
    /// Supervisor-only pages in the kernel root.
    Kernel,
    /// User-accessible pages in the current address space.
    User,
}

/// Physical frames, page tables, kernel heap and slab objects.
pub struct MemoryManager<M: PhysMapper, T: Tlb, P: ProcessContext> {
    vmm: Vmm<M, T>,
    process: P,
    heap: SpinLock<KernelHeap>,
    slab: SpinLock<SlabAllocator>,
}

/// The slab allocator's view of the heap while the slab lock is held.
struct HeapSlabs<'a, M: PhysMapper, T: Tlb> {
    heap: &'a SpinLock<KernelHeap>,
    vmm: &'a Vmm<M, T>,
}

/// Pad the break to a page boundary, then grow by `bytes`. Returns the
/// aligned start of the new region.
fn grow_page_aligned<M: PhysMapper, T: Tlb>(
    heap: &mut KernelHeap,
    vmm: &Vmm<M, T>,
    bytes: u64,
) -> Result<VirtualAddress, MemoryError> {
    let brk = heap.brk();
    let start = brk
        .align_up::<Size4K>()
        .ok_or(MemoryError::OutOfWindow(brk.as_u64()))?;
    let delta = (start - brk)
        .checked_add(bytes)
        .and_then(|d| i64::try_from(d).ok())
        .ok_or(MemoryError::OutOfWindow(brk.as_u64()))?;
    heap.grow(delta, vmm)?;
    Ok(start)
}

impl<M: PhysMapper, T: Tlb> SlabBackend for HeapSlabs<'_, M, T> {
    fn grow_heap(&mut self, bytes: u64) -> Result<VirtualAddress, MemoryError> {
        let vmm = self.vmm;
        self.heap.with_lock(|heap| grow_page_aligned(heap, vmm, bytes))
    }

    fn heap_ptr(&self, va: VirtualAddress) -> Result<*mut u8, MemoryError> {
        self.vmm.ptr_at(self.vmm.kernel_root(), va)
    }
}

impl<M: PhysMapper, T: Tlb, P: ProcessContext> MemoryManager<M, T, P> {
    /// Bring up the memory subsystem on top of an existing kernel root.
    ///
    /// `frame_bitmap` is the frame allocator's storage, one bit per physical
    /// frame; [`FRAME_BITMAP_WORDS`](kernel_info::memory::FRAME_BITMAP_WORDS)
    /// words cover [`MAX_PHYS_FRAMES`](kernel_info::memory::MAX_PHYS_FRAMES). It is
    /// borrowed for good so the manager itself stays small enough to build on
    /// a boot stack.
    ///
    /// 1. Seed the frame bitmap from `memory_map`, keeping
    ///    [`MemoryConfig::reserved_low`] and the kernel root itself in use.
    /// 2. Create the kernel-shared top-level tables, the self-reference and
    ///    the identity window.
    /// 3. Map the initial heap and extend it to [`MemoryConfig::heap_reserve`].
    /// 4. Bootstrap the slab allocator.
    ///
    /// # Errors
    /// [`MemoryError::OutOfFrames`] if memory runs out during any step, or a
    /// conflicting entry in one of the reserved top-level slots.
    pub fn init(
        mapper: M,
        tlb: T,
        process: P,
        kernel_root: RootPage,
        frame_bitmap: &'static mut [u64],
        memory_map: &[BootMemoryRegion],
        config: &MemoryConfig,
    ) -> Result<Self, MemoryError> {
        let mut frames = BitmapFrameAlloc::new(frame_bitmap, config.free_policy);
        let root = kernel_root.base().as_u64();
        frames.init_from_memory_map(memory_map, &[config.reserved_low.clone(), root..root + PAGE_SIZE]);

        let manager = Self {
            vmm: Vmm::new(mapper, tlb, kernel_root, frames, config.yield_hook),
            process,
            heap: SpinLock::with_yield(
                KernelHeap::new(config.heap_base, config.heap_initial_length),
                config.yield_hook,
            ),
            slab: SpinLock::with_yield(SlabAllocator::new(config.free_policy), config.yield_hook),
        };

        manager
            .vmm
            .prepare_kernel_root(&[MMIO_WINDOW_SLOT, KERNEL_WINDOW_SLOT], config.install_identity_window)?;

        manager.heap.with_lock(|heap| {
            if config.heap_initial_length > 0 {
                manager.vmm.map_range(config.heap_base, config.heap_initial_length)?;
            }
            heap.set_length(config.heap_reserve, &manager.vmm).map(|_| ())
        })?;

        manager.slab.with_lock(|slab| slab.bootstrap(&mut manager.slab_backend()))?;

        let stats = manager.frame_stats();
        log::info!(
            "memory manager up: kernel root {}, {} of {} frames free, heap {} bytes at {}",
            kernel_root.base(),
            stats.free,
            stats.capacity,
            manager.heap_length(),
            config.heap_base
        );
        Ok(manager)
    }

    const fn slab_backend(&self) -> HeapSlabs<'_, M, T> {
        HeapSlabs {
            heap: &self.heap,
            vmm: &self.vmm,
        }
    }

    #[inline]
    pub const fn kernel_root(&self) -> RootPage {
        self.vmm.kernel_root()
    }

    /// The root of the address space the process subsystem reports as active.
    #[inline]
    pub fn current_root(&self) -> RootPage {
        self.process.current_root()
    }

    /// # Errors
    /// [`MemoryError::OutOfFrames`].
    pub fn alloc_frame(&self) -> Result<PhysicalPage<Size4K>, MemoryError> {
        self.vmm.alloc_frame()
    }

    /// # Errors
    /// [`MemoryError::InvalidFree`] in strict mode.
    pub fn free_frame(&self, page: PhysicalPage<Size4K>) -> Result<(), MemoryError> {
        self.vmm.free_frame(page)
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.vmm.frame_stats()
    }

    /// Map `len` bytes of fresh zeroed memory and return their start.
    ///
    /// With `va == None` the kernel case takes the pages from the heap break
    /// and the user case places them in the lowest free range of the current
    /// address space at or above [`USER_MMAP_BASE`]. A given `va` is rounded
    /// down to its page.
    ///
    /// Mapping an already mapped page keeps its frame.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRange`] for `len == 0`.
    /// - [`MemoryError::OutOfWindow`] if the range leaves its half.
    /// - [`MemoryError::NoFreeRange`] if no user range is large enough.
    /// - [`MemoryError::OutOfFrames`].
    pub fn map(&self, va: Option<VirtualAddress>, len: u64, target: MapTarget) -> Result<VirtualAddress, MemoryError> {
        if len == 0 {
            return Err(MemoryError::EmptyRange);
        }
        let rounded = align_up(len, PAGE_SIZE).ok_or(MemoryError::OutOfWindow(len))?;
        match (target, va) {
            (MapTarget::Kernel, None) => self
                .heap
                .with_lock(|heap| grow_page_aligned(heap, &self.vmm, rounded)),
            (MapTarget::Kernel, Some(va)) => {
                let start = va.align_down::<Size4K>();
                if start.as_u64() < USERSPACE_END {
                    return Err(MemoryError::OutOfWindow(va.as_u64()));
                }
                self.vmm
                    .map_pages(self.kernel_root(), start, rounded, PageEntryBits::kernel_rw())?;
                Ok(start)
            }
            (MapTarget::User, va) => {
                let root = self.current_root();
                let start = match va {
                    Some(va) => va.align_down::<Size4K>(),
                    None => self.vmm.find_free(
                        root,
                        rounded,
                        VirtualAddress::new(USER_MMAP_BASE),
                        VirtualAddress::new(USERSPACE_END),
                    )?,
                };
                if start.as_u64().checked_add(rounded).is_none_or(|end| end > USERSPACE_END) {
                    return Err(MemoryError::OutOfWindow(start.as_u64()));
                }
                self.vmm.map_pages(root, start, rounded, PageEntryBits::user_rw())?;
                Ok(start)
            }
        }
    }

    /// Unmap `[va, va + len)`: kernel addresses in the kernel root, user
    /// addresses in the current one. Returns the number of pages removed.
    ///
    /// # Errors
    /// [`MemoryError::EmptyRange`] for `len == 0`.
    pub fn unmap(&self, va: VirtualAddress, len: u64) -> Result<u64, MemoryError> {
        let root = if va.as_u64() >= USERSPACE_END {
            self.kernel_root()
        } else {
            self.current_root()
        };
        self.vmm.unmap_pages(root, va, len)
    }

    /// Map the device range `[pa, pa + len)` uncached into the MMIO window
    /// and return the virtual address of `pa`.
    ///
    /// The frames are borrowed: unmapping never releases them.
    ///
    /// # Errors
    /// - [`MemoryError::EmptyRange`] for `len == 0`.
    /// - [`MemoryError::OutOfWindow`] if the range does not fit the window.
    /// - [`MemoryError::OutOfFrames`] for page tables.
    pub fn map_mmio(&self, pa: PhysicalAddress, len: u64, target: MapTarget) -> Result<VirtualAddress, MemoryError> {
        if len == 0 {
            return Err(MemoryError::EmptyRange);
        }
        if pa.as_u64().checked_add(len).is_none_or(|end| end > PML4_SLOT_SPAN) {
            return Err(MemoryError::OutOfWindow(pa.as_u64()));
        }
        let va = VirtualAddress::new(MMIO_BASE + pa.as_u64());
        let (root, user) = match target {
            MapTarget::Kernel => (self.kernel_root(), false),
            MapTarget::User => (self.current_root(), true),
        };
        self.vmm.map_frames(root, va, pa, len, PageEntryBits::mmio(user))?;
        log::debug!("mmio {pa} (+0x{len:X}) at {va}");
        Ok(va)
    }

    /// Identity-window arithmetic, see [`kernel_info::memory::translate_to_physical`].
    #[inline]
    #[must_use]
    pub const fn translate_to_physical(va: VirtualAddress) -> PhysicalAddress {
        kernel_info::memory::translate_to_physical(va)
    }

    /// Identity-window arithmetic, see [`kernel_info::memory::translate_to_kernel_virtual`].
    #[inline]
    #[must_use]
    pub const fn translate_to_kernel_virtual(pa: PhysicalAddress) -> VirtualAddress {
        kernel_info::memory::translate_to_kernel_virtual(pa)
    }

    /// Full page-table translation of `va` in `root`.
    #[must_use]
    pub fn query(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.query(root, va)
    }

    /// Install the caller's `frame` at `va` in `root`. The frame stays owned by
    /// the caller.
    ///
    /// # Errors
    /// [`MemoryError::OutOfFrames`] or a large page in the way.
    pub fn map_frame(
        &self,
        root: RootPage,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), MemoryError> {
        self.vmm.map_frame(root, va, frame, flags)
    }

    /// Duplicate the address space at `root` for a forked process.
    ///
    /// # Errors
    /// [`MemoryError::OutOfFrames`]; every frame claimed so far is returned.
    pub fn clone_address_space(&self, root: RootPage) -> Result<RootPage, MemoryError> {
        self.vmm.clone_space(root)
    }

    /// Release every frame owned by the address space at `root`.
    ///
    /// # Errors
    /// [`MemoryError::ActiveAddressSpace`] for the kernel root and for the
    /// current address space.
    pub fn destroy_address_space(&self, root: RootPage) -> Result<(), MemoryError> {
        if root == self.kernel_root() || root == self.current_root() {
            return Err(MemoryError::ActiveAddressSpace);
        }
        self.vmm.destroy_space(root);
        Ok(())
    }

    /// Switch the hardware to `root`.
    ///
    /// # Safety
    /// `root` must be a complete address space containing the kernel-shared
    /// slots, and the process subsystem must report it as current afterwards.
    pub unsafe fn activate(&self, root: RootPage) {
        unsafe { self.vmm.activate(root) };
    }

    /// Move the heap break by `delta`; returns the previous break.
    ///
    /// # Errors
    /// See [`KernelHeap::grow`].
    pub fn heap_grow(&self, delta: i64) -> Result<VirtualAddress, MemoryError> {
        self.heap.with_lock(|heap| heap.grow(delta, &self.vmm))
    }

    /// # Errors
    /// See [`KernelHeap::set_length`].
    pub fn heap_set_length(&self, length: u64) -> Result<VirtualAddress, MemoryError> {
        self.heap.with_lock(|heap| heap.set_length(length, &self.vmm))
    }

    pub fn heap_length(&self) -> u64 {
        self.heap.with_lock(|heap| heap.length())
    }

    /// # Errors
    /// See [`SlabAllocator::kmalloc`].
    pub fn kmalloc(&self, size: usize) -> Result<VirtualAddress, MemoryError> {
        self.slab.with_lock(|slab| slab.kmalloc(size, &mut self.slab_backend()))
    }

    /// # Errors
    /// See [`SlabAllocator::kcalloc`].
    pub fn kcalloc(&self, count: usize, size: usize) -> Result<VirtualAddress, MemoryError> {
        self.slab
            .with_lock(|slab| slab.kcalloc(count, size, &mut self.slab_backend()))
    }

    /// # Errors
    /// See [`SlabAllocator::kfree`].
    pub fn kfree(&self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        self.slab.with_lock(|slab| slab.kfree(ptr, &mut self.slab_backend()))
    }

    /// # Errors
    /// See [`SlabAllocator::register_size_class`].
    pub fn register_size_class(&self, size: usize) -> Result<(), MemoryError> {
        self.slab
            .with_lock(|slab| slab.register_size_class(size, &mut self.slab_backend()))
    }

    /// # Errors
    /// Heap access failures.
    pub fn class_stats(&self, size: usize) -> Result<Option<ClassStats>, MemoryError> {
        self.slab
            .with_lock(|slab| slab.class_stats(size, &self.slab_backend()))
    }

    /// # Errors
    /// Heap access failures.
    pub fn for_each_slab(&self, size: usize, f: impl FnMut(SlabInfo)) -> Result<(), MemoryError> {
        self.slab
            .with_lock(|slab| slab.for_each_slab(size, &self.slab_backend(), f))
    }

    /// Writable pointer to the kernel heap byte at `va`.
    ///
    /// # Errors
    /// [`MemoryError::Unmapped`] if `va` is not backed in the kernel root.
    pub fn object_ptr(&self, va: VirtualAddress) -> Result<*mut u8, MemoryError> {
        self.vmm.ptr_at(self.kernel_root(), va)
    }

    /// Log the used physical ranges and every size class.
    pub fn dump(&self) {
        let stats = self.frame_stats();
        log::info!(
            "frames: {} used, {} free, {} total",
            stats.used,
            stats.free,
            stats.capacity
        );
        self.vmm.with_frames(|frames| {
            for range in frames.used_ranges() {
                log::info!("  used 0x{:016X}..0x{:016X}", range.start, range.end);
            }
        });
        log::info!("heap: {} bytes", self.heap_length());
        self.slab.with_lock(|slab| {
            let backend = self.slab_backend();
            for size in slab.class_sizes() {
                if let Ok(Some(class)) = slab.class_stats(size as usize, &backend) {
                    log::info!(
                        "  class {:>5}: {} slab(s), {}/{} free",
                        class.object_size,
                        class.slabs,
                        class.free_objects,
                        class.total_objects
                    );
                }
            }
        });
    }
}
