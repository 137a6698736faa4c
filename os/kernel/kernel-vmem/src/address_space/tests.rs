use super::*;
use core::cell::UnsafeCell;
use kernel_info::memory::{IDENTITY_BASE, KERNEL_HEAP_BASE, KERNEL_WINDOW_SLOT, USERSPACE_END};
use std::collections::BTreeSet;

/// A 4 KiB-aligned raw frame standing in for physical RAM.
#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

/// Physical memory as a vector of frames; physical address `n * 4096` is frame `n`.
pub(crate) struct TestPhys {
    frames: Vec<UnsafeCell<Aligned4K>>,
}

impl TestPhys {
    pub(crate) fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let idx = (pa.as_u64() >> 12) as usize;
        let off = (pa.as_u64() & 0xfff) as usize;
        unsafe { self.frames[idx].get().cast::<u8>().add(off) }
    }
}

/// Hands out frames `1..end`, reuses freed ones, and tracks what is live.
pub(crate) struct TestAlloc {
    next: u64,
    end: u64,
    free: Vec<u64>,
    live: BTreeSet<u64>,
    budget: Option<usize>,
}

impl TestAlloc {
    pub(crate) fn new(end: u64) -> Self {
        Self {
            next: 1,
            end,
            free: Vec::new(),
            live: BTreeSet::new(),
            budget: None,
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live.len()
    }

    /// Fail every allocation after the next `n`.
    pub(crate) fn limit(&mut self, n: usize) {
        self.budget = Some(n);
    }
}

impl FrameAlloc for TestAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if let Some(budget) = self.budget.as_mut() {
            *budget = budget.checked_sub(1)?;
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.next < self.end => {
                self.next += 1;
                self.next - 1
            }
            None => return None,
        };
        assert!(self.live.insert(index));
        Some(PhysicalPage::from_addr(PhysicalAddress::new(index << 12)))
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        let index = page.base().as_u64() >> 12;
        assert!(self.live.remove(&index), "double free of frame {index}");
        self.free.push(index);
    }
}

const USER_VA: VirtualAddress = VirtualAddress::new(0x40_0000);

fn bytes_at<M: PhysMapper>(space: &AddressSpace<'_, M>, va: VirtualAddress) -> [u8; 4096] {
    let pa = space.query(va).unwrap();
    *space.frame_bytes(pa.page::<Size4K>())
}

#[test]
fn create_points_self_reference_at_root() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    let self_ref = space.top_entry(SELF_REFERENCE_SLOT);
    assert_eq!(self_ref.kind(TableLevel::Pml4), EntryKind::NextLevel(space.root_page(), PageEntryBits::kernel_rw()));
    assert_eq!(space.table(space.root_page()).occupied(), 1);
}

#[test]
fn resolve_creates_tables_and_zeroed_leaf_once() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    let frame = space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap()
        .unwrap();
    assert_eq!(alloc.live(), 5);
    assert!(space.frame_bytes(frame).iter().all(|&b| b == 0));

    let again = space
        .resolve_or_create(&mut alloc, USER_VA + 0x10, PageEntryBits::user_rw(), true)
        .unwrap();
    assert_eq!(again, Some(frame));
    assert_eq!(alloc.live(), 5);
    assert_eq!(space.query(USER_VA + 0x10), Some(frame.join(0x10)));
}

#[test]
fn resolve_without_create_never_allocates() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    let found = space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), false)
        .unwrap();
    assert_eq!(found, None);
    assert_eq!(alloc.live(), 1);
}

#[test]
fn user_leaves_make_their_tables_user_accessible() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    space
        .resolve_or_create(&mut alloc, USER_VA + 0x20_0000, PageEntryBits::kernel_rw(), true)
        .unwrap();
    assert!(!space.top_entry(0).user_access());

    space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap();
    assert!(space.top_entry(0).user_access());
    let leaf = space.leaf_entry(USER_VA).unwrap();
    assert!(leaf.user_access() && !leaf.borrowed());
}

#[test]
fn borrowed_frames_survive_unmap_owned_frames_do_not() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();
    let device = PhysicalPage::from_addr(PhysicalAddress::new(0xf000));

    space
        .map_frame(&mut alloc, USER_VA, device, PageEntryBits::mmio(true))
        .unwrap();
    assert!(space.leaf_entry(USER_VA).unwrap().borrowed());
    let before = alloc.live();
    assert_eq!(space.unmap_page(&mut alloc, USER_VA), Some(device));
    assert_eq!(alloc.live(), before);

    let owned = space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap()
        .unwrap();
    assert_eq!(space.unmap_page(&mut alloc, USER_VA), Some(owned));
    assert_eq!(alloc.live(), before);
    assert_eq!(space.query(USER_VA), None);
    assert_eq!(space.unmap_page(&mut alloc, USER_VA), None);
}

#[test]
fn map_frame_releases_replaced_owned_frame() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap();
    let before = alloc.live();
    let target = PhysicalPage::from_addr(PhysicalAddress::new(0xe000));
    space
        .map_frame(&mut alloc, USER_VA, target, PageEntryBits::user_rw())
        .unwrap();
    assert_eq!(alloc.live(), before - 1);
    assert_eq!(space.query(USER_VA), Some(target.base()));
}

#[test]
fn identity_window_translates_through_large_pages() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    space.install_identity_window(&mut alloc).unwrap();
    space.install_identity_window(&mut alloc).unwrap();
    assert_eq!(alloc.live(), 2);

    let va = VirtualAddress::new(IDENTITY_BASE + 0x1_2345_6789);
    assert_eq!(space.query(va), Some(PhysicalAddress::new(0x1_2345_6789)));
    assert_eq!(
        space.map_frame(&mut alloc, va, PhysicalPage::from_addr(PhysicalAddress::new(0)), PageEntryBits::kernel_rw()),
        Err(VmemError::LargePageInTheWay(va))
    );
}

#[test]
fn reserved_entries_block_creation() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();
    let marker = PageEntryBits::new().with_os_available_high(1);
    space.table(space.root_page()).set(3, marker);

    let va = VirtualAddress::new(3 << 39);
    assert_eq!(
        space.resolve_or_create(&mut alloc, va, PageEntryBits::user_rw(), true),
        Err(VmemError::ReservedEntry(va))
    );
    assert_eq!(space.resolve_or_create(&mut alloc, va, PageEntryBits::user_rw(), false), Ok(None));
    assert_eq!(space.find_free_range(0x1000, va, VirtualAddress::new(4 << 39)), None);
}

#[test]
fn find_free_range_skips_mapped_pages() {
    let phys = TestPhys::with_frames(16);
    let mut alloc = TestAlloc::new(16);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();
    space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap();

    let end = VirtualAddress::new(USERSPACE_END);
    assert_eq!(space.find_free_range(0x2000, USER_VA, end), Some(USER_VA + 0x1000));
    assert_eq!(space.find_free_range(0x2000, USER_VA, USER_VA + 0x2000), None);
    assert_eq!(space.find_free_range(1, VirtualAddress::new(0x1234), end), Some(VirtualAddress::new(0x2000)));
}

#[test]
fn clone_copies_owned_and_shares_the_rest() {
    let phys = TestPhys::with_frames(64);
    let mut alloc = TestAlloc::new(64);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();

    let owned = space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap()
        .unwrap();
    space.frame_bytes(owned)[..4].copy_from_slice(b"user");
    let device = PhysicalPage::from_addr(PhysicalAddress::new(0x3f000));
    space
        .map_frame(&mut alloc, USER_VA + 0x1000, device, PageEntryBits::mmio(true))
        .unwrap();
    space
        .resolve_or_create(&mut alloc, VirtualAddress::new(KERNEL_HEAP_BASE), PageEntryBits::kernel_rw(), true)
        .unwrap();

    let copy = space.clone_space(&mut alloc).unwrap();

    assert_eq!(copy.top_entry(KERNEL_WINDOW_SLOT), space.top_entry(KERNEL_WINDOW_SLOT));
    assert_eq!(copy.top_entry(SELF_REFERENCE_SLOT).frame(), copy.root_page());
    assert_ne!(copy.top_entry(0).frame(), space.top_entry(0).frame());

    assert_ne!(copy.query(USER_VA), space.query(USER_VA));
    assert_eq!(bytes_at(&copy, USER_VA), bytes_at(&space, USER_VA));
    assert_eq!(copy.query(USER_VA + 0x1000), Some(device.base()));
    assert_eq!(
        copy.query(VirtualAddress::new(KERNEL_HEAP_BASE)),
        space.query(VirtualAddress::new(KERNEL_HEAP_BASE))
    );

    let copied = copy.query(USER_VA).unwrap().page::<Size4K>();
    copy.frame_bytes(copied)[0] = b'X';
    assert_eq!(&bytes_at(&space, USER_VA)[..4], b"user");
}

#[test]
fn failed_clone_returns_every_frame() {
    let phys = TestPhys::with_frames(64);
    let mut alloc = TestAlloc::new(64);
    let space = AddressSpace::create(&phys, &mut alloc).unwrap();
    space
        .resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap();
    let before = alloc.live();

    alloc.limit(3);
    assert_eq!(space.clone_space(&mut alloc).err(), Some(VmemError::OutOfFrames));
    assert_eq!(alloc.live(), before);
    assert!(space.query(USER_VA).is_some());
}

#[test]
fn destroy_frees_exactly_what_the_space_owns() {
    let phys = TestPhys::with_frames(64);
    let mut alloc = TestAlloc::new(64);
    let kernel = AddressSpace::create(&phys, &mut alloc).unwrap();
    kernel
        .resolve_or_create(&mut alloc, VirtualAddress::new(KERNEL_HEAP_BASE), PageEntryBits::kernel_rw(), true)
        .unwrap();
    let device = alloc.alloc_4k().unwrap();
    let baseline = alloc.live();

    let user = kernel.clone_space(&mut alloc).unwrap();
    user.resolve_or_create(&mut alloc, USER_VA, PageEntryBits::user_rw(), true)
        .unwrap();
    user.resolve_or_create(&mut alloc, USER_VA + 0x1000, PageEntryBits::user_rw(), true)
        .unwrap();
    user.map_frame(&mut alloc, USER_VA + 0x2000, device, PageEntryBits::mmio(true))
        .unwrap();
    assert!(alloc.live() > baseline);

    user.destroy(&mut alloc);
    assert_eq!(alloc.live(), baseline);
    assert!(kernel.query(VirtualAddress::new(KERNEL_HEAP_BASE)).is_some());
}
