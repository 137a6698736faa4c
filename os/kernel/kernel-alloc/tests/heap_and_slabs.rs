mod common;

use common::{Harness, boot};
use kernel_alloc::{FreePolicy, MapTarget, MemoryError};
use kernel_memory_addresses::VirtualAddress;
use std::sync::{Arc, Barrier};
use std::thread;

fn assert_slabs_consistent(h: &Harness, size: usize) {
    h.mm.for_each_slab(size, |slab| {
        assert_eq!(
            slab.free_objects,
            slab.total_objects - slab.used_bits,
            "{size}-byte slab at {}",
            slab.base
        );
    })
    .unwrap();
}

fn bootstrap_page(h: &Harness) -> u64 {
    h.config.heap_base.as_u64() + h.config.heap_reserve
}

#[test]
fn init_reserves_the_heap() {
    let h = boot(FreePolicy::Strict);
    assert!(h.mm.heap_length() > h.config.heap_reserve);
    let brk = h.mm.heap_grow(0).unwrap();
    assert_eq!(brk.as_u64(), h.config.heap_base.as_u64() + h.mm.heap_length());
}

#[test]
fn bootstrap_classes_serve_the_first_requests() {
    let h = boot(FreePolicy::Strict);
    let page = bootstrap_page(&h);

    let record = h.mm.kmalloc(40).unwrap().as_u64();
    assert!((page..page + 2048).contains(&record));
    assert_eq!(h.mm.kmalloc(8).unwrap().as_u64(), page + 2048);
}

#[test]
fn registered_class_chains_a_second_slab() {
    let h = boot(FreePolicy::Strict);
    h.mm.register_size_class(96).unwrap();

    let mut objects = Vec::new();
    for _ in 0..42 {
        objects.push(h.mm.kmalloc(96).unwrap());
    }
    assert_eq!(h.mm.class_stats(96).unwrap().unwrap().slabs, 1);
    objects.push(h.mm.kmalloc(96).unwrap());
    assert_eq!(h.mm.class_stats(96).unwrap().unwrap().slabs, 2);
    for _ in 43..64 {
        objects.push(h.mm.kmalloc(96).unwrap());
    }

    let stats = h.mm.class_stats(96).unwrap().unwrap();
    assert_eq!((stats.total_objects, stats.free_objects), (84, 20));

    h.mm.kfree(objects[5]).unwrap();
    assert_eq!(h.mm.class_stats(96).unwrap().unwrap().free_objects, 21);
    assert_eq!(h.mm.kmalloc(96).unwrap(), objects[5]);
    assert_eq!(h.mm.class_stats(96).unwrap().unwrap().slabs, 2);
    assert_slabs_consistent(&h, 96);
}

#[test]
fn objects_are_writable_and_kcalloc_zeroes() {
    let h = boot(FreePolicy::Strict);
    let va = h.mm.kmalloc(256).unwrap();
    let ptr = h.mm.object_ptr(va).unwrap();
    unsafe { ptr.write_bytes(0x5a, 256) };
    h.mm.kfree(va).unwrap();

    let zeroed = h.mm.kcalloc(16, 16).unwrap();
    assert_eq!(zeroed, va);
    let bytes = unsafe { std::slice::from_raw_parts(h.mm.object_ptr(zeroed).unwrap(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn oversized_requests_have_no_class() {
    let h = boot(FreePolicy::Strict);
    assert_eq!(h.mm.kmalloc(16 * 1024 + 1), Err(MemoryError::NoSizeClass(16 * 1024 + 1)));
    h.mm.register_size_class(20_000).unwrap();
    assert!(h.mm.kmalloc(20_000).is_ok());
}

#[test]
fn strict_policy_reports_bad_frees() {
    let h = boot(FreePolicy::Strict);
    let va = h.mm.kmalloc(64).unwrap();
    h.mm.kfree(va).unwrap();
    assert_eq!(h.mm.kfree(va), Err(MemoryError::InvalidFree(va.as_u64())));
    assert_eq!(
        h.mm.kfree(VirtualAddress::new(0x1234)),
        Err(MemoryError::InvalidFree(0x1234))
    );

    let frame = h.mm.alloc_frame().unwrap();
    h.mm.free_frame(frame).unwrap();
    assert_eq!(h.mm.free_frame(frame), Err(MemoryError::InvalidFree(frame.base().as_u64())));
}

#[test]
fn lenient_policy_ignores_bad_frees() {
    let h = boot(FreePolicy::Lenient);
    let va = h.mm.kmalloc(64).unwrap();
    h.mm.kfree(va).unwrap();
    let before = h.mm.class_stats(64).unwrap();

    assert_eq!(h.mm.kfree(va), Ok(()));
    assert_eq!(h.mm.kfree(VirtualAddress::new(0x1234)), Ok(()));
    assert_eq!(h.mm.class_stats(64).unwrap(), before);

    let frame = h.mm.alloc_frame().unwrap();
    h.mm.free_frame(frame).unwrap();
    let free = h.free_frames();
    assert_eq!(h.mm.free_frame(frame), Ok(()));
    assert_eq!(h.free_frames(), free);
}

#[test]
fn heap_shrink_returns_whole_pages() {
    let h = boot(FreePolicy::Strict);
    let length = h.mm.heap_length();

    let old = h.mm.heap_grow(0x10000).unwrap();
    assert_eq!(old.as_u64(), h.config.heap_base.as_u64() + length);
    let grown = h.free_frames();

    assert_eq!(h.mm.heap_grow(-0x10000).unwrap().as_u64(), old.as_u64() + 0x10000);
    assert_eq!(h.free_frames(), grown + 16);
    assert_eq!(h.mm.heap_length(), length);
    assert_eq!(h.mm.query(h.mm.kernel_root(), old), None);

    h.mm.heap_set_length(length + 0x3000).unwrap();
    assert_eq!(h.free_frames(), grown + 13);
    h.mm.heap_set_length(length).unwrap();
    assert_eq!(h.free_frames(), grown + 16);
}

#[test]
fn kernel_maps_without_address_extend_the_heap() {
    let h = boot(FreePolicy::Strict);
    let length = h.mm.heap_length();

    let va = h.mm.map(None, 0x1800, MapTarget::Kernel).unwrap();
    assert_eq!(va.as_u64(), h.config.heap_base.as_u64() + length);
    assert_eq!(h.mm.heap_length(), length + 0x2000);
    assert!(h.mm.query(h.mm.kernel_root(), va + 0x1fff).is_some());
}

#[test]
fn bitmaps_track_counters_under_mixed_traffic() {
    let h = boot(FreePolicy::Strict);
    h.mm.register_size_class(24).unwrap();
    let sizes = [8, 24, 40, 96, 200, 1000, 3000];
    let mut live = Vec::new();
    for round in 0..500usize {
        live.push(h.mm.kmalloc(sizes[round % sizes.len()]).unwrap());
        if round % 3 == 2 {
            let victim = live.swap_remove((round * 7) % live.len());
            h.mm.kfree(victim).unwrap();
        }
    }
    for size in [8, 24, 40, 128, 256, 1024, 4096] {
        assert_slabs_consistent(&h, size);
    }
    h.mm.dump();
}

#[test]
fn concurrent_kmalloc_and_kfree() {
    const THREADS: usize = 4;
    let h = Arc::new(boot(FreePolicy::Strict));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let h = Arc::clone(&h);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut mine = Vec::new();
                for i in 0..200 {
                    let va = h.mm.kmalloc(32 + (t * 8)).unwrap();
                    unsafe { h.mm.object_ptr(va).unwrap().write(t as u8) };
                    mine.push(va);
                    if i % 2 == 1 {
                        let va = mine.remove(0);
                        assert_eq!(unsafe { h.mm.object_ptr(va).unwrap().read() }, t as u8);
                        h.mm.kfree(va).unwrap();
                    }
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<u64> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .map(VirtualAddress::as_u64)
        .collect();
    let count = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), count);
    for size in [32, 40, 64] {
        assert_slabs_consistent(&h, size);
    }
}
