mod common;

use common::{Harness, boot};
use kernel_alloc::{FreePolicy, MapTarget, MemoryError, MemoryManager};
use kernel_info::memory::{
    IDENTITY_BASE, KERNEL_HEAP_BASE, MMIO_BASE, MMIO_WINDOW_SLOT, PML4_SLOT_SPAN, SELF_REFERENCE_SLOT,
    USER_MMAP_BASE, USERSPACE_END,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::AddressSpace;

const PATTERN: &[u8] = b"the quick brown fox jumps over the lazy dog";

fn user_page_with_pattern(h: &Harness) -> (kernel_vmem::RootPage, VirtualAddress) {
    let root = h.spawn_process();
    let va = h.mm.map(None, 4096, MapTarget::User).unwrap();
    let pa = h.mm.query(root, va).unwrap();
    h.ram.write(pa, PATTERN);
    (root, va)
}

#[test]
fn init_prepares_the_kernel_root() {
    let h = boot(FreePolicy::Strict);
    let space = AddressSpace::from_root(&h.ram, h.mm.kernel_root());
    assert_eq!(space.top_entry(SELF_REFERENCE_SLOT).frame(), h.mm.kernel_root());
    assert!(space.top_entry(MMIO_WINDOW_SLOT).present());
    assert_eq!(
        h.mm.query(h.mm.kernel_root(), VirtualAddress::new(IDENTITY_BASE + 0x1234_5678)),
        Some(PhysicalAddress::new(0x1234_5678))
    );
    assert!(h.mm.query(h.mm.kernel_root(), VirtualAddress::new(KERNEL_HEAP_BASE)).is_some());
    assert!(h.tlb.invalidations() > 0);
}

#[test]
fn identity_arithmetic() {
    type M = MemoryManager<common::Ram, common::CountingTlb, common::Current>;
    let va = M::translate_to_kernel_virtual(PhysicalAddress::new(0xb8000));
    assert_eq!(va.as_u64(), IDENTITY_BASE | 0xb8000);
    assert_eq!(M::translate_to_physical(va), PhysicalAddress::new(0xb8000));
}

#[test]
fn anonymous_user_maps_start_at_the_mmap_base() {
    let h = boot(FreePolicy::Strict);
    let root = h.spawn_process();

    let first = h.mm.map(None, 100, MapTarget::User).unwrap();
    let second = h.mm.map(None, 0x2000, MapTarget::User).unwrap();
    assert_eq!(first.as_u64(), USER_MMAP_BASE);
    assert_eq!(second.as_u64(), USER_MMAP_BASE + 0x1000);

    let leaf = h.leaf(root, second + 0x1000).unwrap();
    assert!(leaf.user_access() && leaf.writable() && !leaf.borrowed());
    assert!(h.leaf(h.mm.kernel_root(), first).is_none());
}

#[test]
fn remapping_does_not_leak_frames() {
    let h = boot(FreePolicy::Strict);
    let root = h.spawn_process();
    let va = VirtualAddress::new(0x7000_0000);

    h.mm.map(Some(va), 0x3000, MapTarget::User).unwrap();
    let pa = h.mm.query(root, va).unwrap();
    let free = h.free_frames();

    assert_eq!(h.mm.map(Some(va + 0x10), 0x3000, MapTarget::User).unwrap(), va);
    assert_eq!(h.free_frames(), free);
    assert_eq!(h.mm.query(root, va), Some(pa));
}

#[test]
fn unmap_returns_frames() {
    let h = boot(FreePolicy::Strict);
    let root = h.spawn_process();
    let va = h.mm.map(None, 0x4000, MapTarget::User).unwrap();
    let free = h.free_frames();

    assert_eq!(h.mm.unmap(va, 0x4000).unwrap(), 4);
    assert_eq!(h.free_frames(), free + 4);
    assert_eq!(h.mm.query(root, va), None);
    assert_eq!(h.mm.unmap(va, 0x4000).unwrap(), 0);
    assert_eq!(h.mm.unmap(va, 0), Err(MemoryError::EmptyRange));
}

#[test]
fn user_maps_stay_in_the_lower_half() {
    let h = boot(FreePolicy::Strict);
    h.spawn_process();
    let va = VirtualAddress::new(USERSPACE_END - 0x1000);
    assert_eq!(
        h.mm.map(Some(va), 0x2000, MapTarget::User),
        Err(MemoryError::OutOfWindow(va.as_u64()))
    );
    assert_eq!(
        h.mm.map(Some(VirtualAddress::new(0x1000)), 0x1000, MapTarget::Kernel),
        Err(MemoryError::OutOfWindow(0x1000))
    );
}

#[test]
fn clone_copies_user_pages_and_shares_the_kernel() {
    let h = boot(FreePolicy::Strict);
    let (parent, va) = user_page_with_pattern(&h);

    let child = h.mm.clone_address_space(parent).unwrap();
    let parent_pa = h.mm.query(parent, va).unwrap();
    let child_pa = h.mm.query(child, va).unwrap();
    assert_ne!(parent_pa, child_pa);
    assert_eq!(h.ram.read(child_pa, PATTERN.len()), PATTERN);

    h.ram.write(child_pa, b"X");
    assert_eq!(h.ram.read(parent_pa, 1), b"t");

    let heap = VirtualAddress::new(KERNEL_HEAP_BASE);
    assert_eq!(h.mm.query(parent, heap), h.mm.query(child, heap));
    let child_space = AddressSpace::from_root(&h.ram, child);
    assert_eq!(child_space.top_entry(SELF_REFERENCE_SLOT).frame(), child);
}

#[test]
fn failed_clone_releases_everything_it_took() {
    let h = boot(FreePolicy::Strict);
    let (parent, _) = user_page_with_pattern(&h);

    let held = h.drain_to(3);
    assert_eq!(h.mm.clone_address_space(parent), Err(MemoryError::OutOfFrames));
    assert_eq!(h.free_frames(), 3);

    for frame in held {
        h.mm.free_frame(frame).unwrap();
    }
    assert!(h.mm.clone_address_space(parent).is_ok());
}

#[test]
fn destroy_returns_what_the_clone_claimed() {
    let h = boot(FreePolicy::Strict);
    let (parent, _) = user_page_with_pattern(&h);
    let free = h.free_frames();

    let child = h.mm.clone_address_space(parent).unwrap();
    assert_eq!(h.free_frames(), free - 5);
    h.mm.destroy_address_space(child).unwrap();
    assert_eq!(h.free_frames(), free);
}

#[test]
fn active_spaces_cannot_be_destroyed() {
    let h = boot(FreePolicy::Strict);
    let process = h.spawn_process();
    assert_eq!(h.mm.destroy_address_space(process), Err(MemoryError::ActiveAddressSpace));
    assert_eq!(
        h.mm.destroy_address_space(h.mm.kernel_root()),
        Err(MemoryError::ActiveAddressSpace)
    );

    h.current.set(h.mm.kernel_root());
    assert_eq!(h.mm.destroy_address_space(process), Ok(()));
}

#[test]
fn mmio_is_uncached_and_borrowed() {
    let h = boot(FreePolicy::Strict);
    let device = h.mm.alloc_frame().unwrap();
    let pa = device.base() + 0x10;

    let va = h.mm.map_mmio(pa, 0x20, MapTarget::Kernel).unwrap();
    assert_eq!(va.as_u64(), MMIO_BASE + pa.as_u64());
    assert_eq!(h.mm.query(h.mm.kernel_root(), va), Some(pa));
    let leaf = h.leaf(h.mm.kernel_root(), va).unwrap();
    assert!(leaf.cache_disabled() && leaf.writable() && leaf.borrowed());
    assert!(!leaf.user_access());

    let free = h.free_frames();
    assert_eq!(h.mm.unmap(va, 0x20).unwrap(), 1);
    assert_eq!(h.free_frames(), free);
    h.mm.free_frame(device).unwrap();
}

#[test]
fn user_mmio_is_user_accessible() {
    let h = boot(FreePolicy::Strict);
    let root = h.spawn_process();
    let va = h.mm.map_mmio(PhysicalAddress::new(0xfee0_0000), 0x1000, MapTarget::User).unwrap();
    assert!(h.leaf(root, va).unwrap().user_access());

    assert_eq!(
        h.mm.map_mmio(PhysicalAddress::new(PML4_SLOT_SPAN - 0x1000), 0x2000, MapTarget::Kernel),
        Err(MemoryError::OutOfWindow(PML4_SLOT_SPAN - 0x1000))
    );
    assert_eq!(
        h.mm.map_mmio(PhysicalAddress::new(0x1000), 0, MapTarget::Kernel),
        Err(MemoryError::EmptyRange)
    );
}

#[test]
fn activate_loads_the_root() {
    let h = boot(FreePolicy::Strict);
    let process = h.spawn_process();
    unsafe { h.mm.activate(process) };
    assert_eq!(h.tlb.loaded_root(), process.base().as_u64());
}
