// Whole-subsystem scenarios driven through the public API, with a leaked
// host buffer standing in for physical RAM.

use rvk_hal::allocator::{BuddyAllocator, MAX_ORDER, PAGE_SIZE, Page};
use rvk_hal::{
    CorruptionPolicy, DirectMap, MemorySubsystem, MmConfig, PageSize, PteFlags, RegionKind,
    VmError,
};
use std::alloc::{Layout, alloc_zeroed};

const RAM_BASE: usize = 0x8000_0000;

fn config() -> MmConfig {
    MmConfig {
        phys_base: RAM_BASE,
        phys_size: 32 * 1024 * 1024,
        kernel_reserved: 2 * 1024 * 1024,
        vmalloc_start: 0xFFFF_FFD0_0000_0000,
        vmalloc_size: 8 * 1024 * 1024,
        max_regions: 16,
        max_caches: 16,
        identity_map: true,
        enable_translation: false,
        policy: CorruptionPolicy::Report,
    }
}

/// Back `config.phys_size` bytes of fake RAM with a host allocation.
fn fake_ram(config: &MmConfig) -> DirectMap {
    let layout = Layout::from_size_align(config.phys_size, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    DirectMap::with_offset((ptr as usize).wrapping_sub(config.phys_base))
}

fn boot() -> (DirectMap, MemorySubsystem) {
    let config = config();
    let map = fake_ram(&config);
    let mm = unsafe { MemorySubsystem::init(config, map) }.unwrap();
    (map, mm)
}

#[test]
fn boot_leaves_most_frames_free() {
    let (_map, mm) = boot();
    let stats = mm.frames().stats();
    assert_eq!(stats.total, (32 - 2) * 1024 * 1024 / PAGE_SIZE);
    assert!(stats.free > stats.total * 9 / 10);
    assert!(mm.slab_verify().is_clean());
}

#[test]
fn order_11_block_drains_and_recoalesces() {
    let pages = 1 << MAX_ORDER;
    let mem_map = Box::leak(vec![Page::reserved(); pages].into_boxed_slice());
    let mut buddy = BuddyAllocator::new();
    unsafe {
        buddy.init(mem_map, RAM_BASE);
        buddy.add_range(RAM_BASE, RAM_BASE + pages * PAGE_SIZE);
    }
    assert_eq!(buddy.free_blocks(MAX_ORDER), 1);

    let frames: Vec<usize> = (0..pages).map(|_| buddy.alloc(0).unwrap()).collect();
    assert_eq!(buddy.alloc(0), None);

    let mut sorted = frames.clone();
    sorted.sort_unstable();
    for pa in sorted {
        buddy.free(pa, 0).unwrap();
    }
    assert_eq!(buddy.free_blocks(MAX_ORDER), 1);
    assert_eq!(buddy.free_frames(), pages);
}

#[test]
fn every_order_is_naturally_aligned() {
    let (_map, mm) = boot();
    for order in 0..=8 {
        let pa = mm.frames().alloc(order).unwrap();
        assert_eq!(pa % (PAGE_SIZE << order), 0, "order {order}");
        mm.frames().free(pa, order).unwrap();
    }
}

#[test]
fn cache_of_24_byte_objects() {
    let (_map, mm) = boot();
    let cache = mm.cache_create("dentry", 24).unwrap();
    assert_eq!(mm.cache_stats(cache).unwrap().objects_per_slab, 169);

    let before = mm.frames().stats().free;
    let mut objects = Vec::new();
    for _ in 0..169 {
        objects.push(mm.cache_alloc(cache).unwrap());
    }
    assert_eq!(mm.frames().stats().free, before - 1);
    let stats = mm.cache_stats(cache).unwrap();
    assert_eq!((stats.partial_slabs, stats.full_slabs), (0, 1));

    objects.push(mm.cache_alloc(cache).unwrap());
    assert_eq!(mm.frames().stats().free, before - 2);

    for obj in objects {
        mm.cache_free(cache, obj).unwrap();
        assert!(mm.slab_verify().is_clean());
    }
    let stats = mm.cache_stats(cache).unwrap();
    assert_eq!(stats.empty_slabs, 1);
    assert_eq!(mm.frames().stats().free, before - 1);
}

#[test]
fn kalloc_mixed_sizes_stay_consistent() {
    let (_map, mm) = boot();
    let sizes = [1, 8, 31, 32, 33, 200, 1000, 2048, 2049, 4096];
    let ptrs: Vec<_> = sizes.iter().map(|&s| mm.kalloc(s).unwrap()).collect();
    for (ptr, &size) in ptrs.iter().zip(&sizes) {
        unsafe { ptr.as_ptr().write_bytes(0xCD, size) };
    }
    assert!(mm.slab_verify().is_clean());
    for ptr in ptrs.into_iter().rev() {
        mm.kfree(ptr.as_ptr());
    }
    let report = mm.slab_verify();
    assert!(report.is_clean());
    assert_eq!(report.objects_inuse, 0);
}

#[test]
fn page_table_round_trip_and_protect() {
    let (_map, mm) = boot();
    let va = 0xFFFF_FFE0_0000_0000 + 0x5000;
    let pa = RAM_BASE + 0x40_0000;

    mm.map_leaf(va, pa, PteFlags::KERNEL_RW, PageSize::Size4K).unwrap();
    let t = mm.lookup(va + 0x9A).unwrap();
    assert_eq!(t.phys, pa + 0x9A);
    assert_eq!(t.flags, PteFlags::KERNEL_RW | PteFlags::VALID);

    mm.protect(va, PteFlags::KERNEL_RX).unwrap();
    let t = mm.lookup(va + 0x9A).unwrap();
    assert_eq!(t.phys, pa + 0x9A);
    assert_eq!(t.flags, PteFlags::KERNEL_RX);

    assert_eq!(mm.unmap(va), Ok(pa));
    assert!(mm.lookup(va).is_none());
}

#[test]
fn vmalloc_round_trip_with_guard_page() {
    let (map, mm) = boot();
    let config = *mm.config();
    let pages = 4;

    let va = mm.vmalloc(pages * PAGE_SIZE).unwrap();
    assert_eq!(va % PAGE_SIZE, 0);
    assert!(va >= config.vmalloc_start && va + pages * PAGE_SIZE <= config.vmalloc_end());

    for i in 0..pages {
        let t = mm.lookup(va + i * PAGE_SIZE).unwrap();
        assert!(t.flags.contains(PteFlags::READ | PteFlags::WRITE));
        let bytes = unsafe {
            std::slice::from_raw_parts(map.phys_to_virt(t.phys) as *const u8, PAGE_SIZE)
        };
        assert!(bytes.iter().all(|&b| b == 0));
    }
    assert!(mm.lookup(va + pages * PAGE_SIZE).is_none(), "guard page");

    let region = mm.find_region(va).unwrap();
    assert_eq!(region.kind(), RegionKind::Alloc);
    assert_eq!(region.guard_page(), va + pages * PAGE_SIZE);

    let free = mm.frames().stats().free;
    mm.vfree(va).unwrap();
    assert!(mm.frames().stats().free >= free + pages);
    assert!(mm.find_region(va).is_none());
    assert_eq!(mm.vmalloc(PAGE_SIZE), Ok(va));
}

#[test]
fn ioremap_and_wrong_release_kind() {
    let (_map, mm) = boot();
    let uart = 0x1000_0000;

    let va = mm.ioremap(uart + 0x5, 8).unwrap();
    assert_eq!(va % PAGE_SIZE, 0x5);
    assert_eq!(mm.lookup(va).unwrap().phys, uart + 0x5);

    assert_eq!(mm.vfree(va & !(PAGE_SIZE - 1)), Err(VmError::WrongKind));
    assert!(mm.lookup(va).is_some(), "rejected release leaves the mapping");
    mm.iounmap(va).unwrap();
    assert!(mm.lookup(va).is_none());
}
