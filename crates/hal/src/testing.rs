//! Host fixtures: a leaked heap buffer stands in for physical RAM.

use crate::allocator::{BuddyAllocator, PAGE_SIZE, Page};
use crate::config::{CorruptionPolicy, MmConfig};
use crate::memory::FrameAllocator;
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{Layout, alloc_zeroed};
use std::boxed::Box;
use std::vec;

/// Physical address the fake RAM pretends to start at.
pub(crate) const FAKE_PHYS_BASE: usize = 0x8000_0000;

pub(crate) struct HostMemory {
    pub base: usize,
    pub size: usize,
    pub map: DirectMap,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self {
            base: FAKE_PHYS_BASE,
            size,
            map: DirectMap::with_offset((ptr as usize).wrapping_sub(FAKE_PHYS_BASE)),
        }
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Read a byte of fake physical memory.
    pub fn read_u8(&self, pa: usize) -> u8 {
        unsafe { self.map.as_mut_ptr::<u8>(pa).read() }
    }
}

/// Frame allocator over `pages` frames of fake RAM.
pub(crate) fn frames(pages: usize) -> (HostMemory, FrameAllocator) {
    frames_with_policy(pages, CorruptionPolicy::Report)
}

pub(crate) fn frames_with_policy(
    pages: usize,
    policy: CorruptionPolicy,
) -> (HostMemory, FrameAllocator) {
    let host = HostMemory::new(pages * PAGE_SIZE);
    let mem_map = Box::leak(vec![Page::reserved(); pages].into_boxed_slice());
    let mut buddy = BuddyAllocator::new();
    unsafe {
        buddy.init(mem_map, host.base);
        buddy.add_range(host.base, host.end());
    }
    (host, FrameAllocator::new(buddy, policy))
}

/// 16 MiB of RAM, 1 MiB kernel image, a 4 MiB vmalloc window.
pub(crate) fn small_config() -> MmConfig {
    MmConfig {
        phys_base: FAKE_PHYS_BASE,
        phys_size: 16 * 1024 * 1024,
        kernel_reserved: 1024 * 1024,
        vmalloc_start: 0xFFFF_FFD0_0000_0000,
        vmalloc_size: 4 * 1024 * 1024,
        max_regions: 8,
        max_caches: 12,
        identity_map: true,
        enable_translation: false,
        policy: CorruptionPolicy::Report,
    }
}

/// Counts calls and can be told to start failing.
pub(crate) struct CountingFrames {
    inner: FrameAllocator,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    budget: AtomicUsize,
}

impl CountingFrames {
    pub fn new(inner: FrameAllocator) -> Self {
        Self {
            inner,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Let `n` more allocations succeed, then fail every one after.
    pub fn fail_after(&self, n: usize) {
        self.budget.store(n, Ordering::SeqCst);
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &FrameAllocator {
        &self.inner
    }
}

impl PageAllocator for CountingFrames {
    fn alloc_pages(&self, order: usize) -> Option<usize> {
        let budget = self.budget.load(Ordering::SeqCst);
        if budget == 0 {
            return None;
        }
        if budget != usize::MAX {
            self.budget.store(budget - 1, Ordering::SeqCst);
        }
        let pa = self.inner.alloc(order)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Some(pa)
    }

    fn free_pages(&self, pa: usize, order: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free_pages(pa, order);
    }
}
