#![allow(dead_code)]

use core::cell::UnsafeCell;
use kernel_alloc::{FreePolicy, MemoryConfig, MemoryManager, ProcessContext};
use kernel_info::boot::{BootMemoryKind, BootMemoryRegion};
use kernel_memory_addresses::{FrameIndex, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{PageEntryBits, PhysMapper, RootPage, Tlb};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Frames of fake RAM given to every test.
pub const FRAMES: u64 = 2048;

/// Frame holding the kernel root.
pub const KERNEL_ROOT_FRAME: u64 = 2;

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

struct Frames(Vec<UnsafeCell<Aligned4K>>);

// SAFETY: access is serialised by the memory manager's locks, or by the test.
unsafe impl Sync for Frames {}
unsafe impl Send for Frames {}

/// Fake physical memory; physical address `n * 4096` is frame `n`.
#[derive(Clone)]
pub struct Ram(Arc<Frames>);

impl Ram {
    pub fn with_frames(n: u64) -> Self {
        Self(Arc::new(Frames(
            (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        )))
    }

    pub fn read(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let ptr = unsafe { self.phys_to_ptr(pa) };
        unsafe { std::slice::from_raw_parts(ptr, len).to_vec() }
    }

    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let ptr = unsafe { self.phys_to_ptr(pa) };
        unsafe { ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
    }
}

impl PhysMapper for Ram {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let index = (pa.as_u64() >> 12) as usize;
        let offset = (pa.as_u64() & 0xfff) as usize;
        unsafe { self.0.0[index].get().cast::<u8>().add(offset) }
    }
}

/// Counts invalidations and remembers the last loaded root.
#[derive(Clone, Default)]
pub struct CountingTlb(Arc<(AtomicUsize, AtomicU64)>);

impl CountingTlb {
    pub fn invalidations(&self) -> usize {
        self.0.0.load(Ordering::Relaxed)
    }

    pub fn loaded_root(&self) -> u64 {
        self.0.1.load(Ordering::Relaxed)
    }
}

impl Tlb for CountingTlb {
    fn invalidate_page(&self, _page: VirtualPage<Size4K>) {
        self.0.0.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn load_root(&self, root: RootPage) {
        self.0.1.store(root.base().as_u64(), Ordering::Relaxed);
    }
}

/// The "current process" as seen by the memory manager.
#[derive(Clone)]
pub struct Current(Arc<AtomicU64>);

impl Current {
    pub fn set(&self, root: RootPage) {
        self.0.store(root.base().as_u64(), Ordering::Relaxed);
    }
}

impl ProcessContext for Current {
    fn current_root(&self) -> RootPage {
        PhysicalPage::from_addr(PhysicalAddress::new(self.0.load(Ordering::Relaxed)))
    }
}

pub type Manager = MemoryManager<Ram, CountingTlb, Current>;

pub struct Harness {
    pub mm: Manager,
    pub ram: Ram,
    pub tlb: CountingTlb,
    pub current: Current,
    pub config: MemoryConfig,
}

pub fn kernel_root() -> RootPage {
    PhysicalPage::from_frame_index(FrameIndex::new(KERNEL_ROOT_FRAME))
}

pub fn config(policy: FreePolicy) -> MemoryConfig {
    MemoryConfig {
        reserved_low: 0..KERNEL_ROOT_FRAME * 4096,
        ..MemoryConfig::default()
    }
    .with_free_policy(policy)
}

/// Storage for the frame bitmap, one bit per frame of fake RAM.
pub fn frame_bitmap() -> &'static mut [u64] {
    Box::leak(vec![0; (FRAMES / 64) as usize].into_boxed_slice())
}

pub fn boot(policy: FreePolicy) -> Harness {
    boot_with_map(
        policy,
        &[
            BootMemoryRegion::new(0, FRAMES * 4096, BootMemoryKind::Available),
            BootMemoryRegion::new(0xfec0_0000, 0xfee0_1000, BootMemoryKind::Reserved),
        ],
    )
}

pub fn boot_with_map(policy: FreePolicy, memory_map: &[BootMemoryRegion]) -> Harness {
    let ram = Ram::with_frames(FRAMES);
    let tlb = CountingTlb::default();
    let current = Current(Arc::new(AtomicU64::new(kernel_root().base().as_u64())));
    let config = config(policy);
    let mm = MemoryManager::init(
        ram.clone(),
        tlb.clone(),
        current.clone(),
        kernel_root(),
        frame_bitmap(),
        memory_map,
        &config,
    )
    .unwrap();
    Harness {
        mm,
        ram,
        tlb,
        current,
        config,
    }
}

impl Harness {
    /// A fresh process address space cloned from the kernel root, made current.
    pub fn spawn_process(&self) -> RootPage {
        let root = self.mm.clone_address_space(self.mm.kernel_root()).unwrap();
        self.current.set(root);
        root
    }

    pub fn leaf(&self, root: RootPage, va: VirtualAddress) -> Option<PageEntryBits> {
        kernel_vmem::AddressSpace::from_root(&self.ram, root).leaf_entry(va)
    }

    pub fn free_frames(&self) -> usize {
        self.mm.frame_stats().free
    }

    /// Allocate frames until only `keep` remain free.
    pub fn drain_to(&self, keep: usize) -> Vec<PhysicalPage<Size4K>> {
        let mut held = Vec::new();
        while self.free_frames() > keep {
            held.push(self.mm.alloc_frame().unwrap());
        }
        held
    }
}
