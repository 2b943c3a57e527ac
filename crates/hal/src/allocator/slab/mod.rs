//! Slab allocator: named object caches plus the `kalloc`/`kfree` facility.
//!
//! Each slab is one frame from the frame allocator. Requests up to 2048 bytes
//! go to a power-of-two size-class cache; 2049..=4096 bytes get a whole frame;
//! anything larger is refused.

mod cache;
mod page;

pub use cache::SlabCache;
pub use page::{DATA_SIZE, HEADER_SIZE, SLAB_MAGIC, SlabHeader};

use crate::allocator::PAGE_SIZE;
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use core::ptr::NonNull;
use rvk_error::define_kernel_error;

/// Hard ceiling on the cache table.
pub const MAX_CACHES: usize = 64;
/// Object sizes of the `kalloc` caches.
pub const KMALLOC_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];
const KMALLOC_NAMES: [&str; 7] = [
    "size-32", "size-64", "size-128", "size-256", "size-512", "size-1024", "size-2048",
];
/// Largest `kalloc` request.
pub const KMALLOC_MAX: usize = PAGE_SIZE;
/// Object alignment.
pub const MIN_ALIGN: usize = size_of::<usize>();

define_kernel_error! {
    /// Slab allocator errors (0x03xx)
    pub enum SlabError(0x03) {
        InvalidSize = 0x01 => "Object size is zero",
        /// Not even one object fits next to the slab header
        TooLarge = 0x02 => "Object too large for a one-frame slab",
        NoCacheSlot = 0x03 => "Cache table is full",
        /// Slot empty or reused since the handle was issued
        InvalidHandle = 0x04 => "Unknown or stale cache handle",
        OutOfMemory = 0x05 => "Frame allocator exhausted",
        NotSlab = 0x06 => "Pointer is not inside a slab",
        ForeignCache = 0x07 => "Object belongs to another cache",
        BadPointer = 0x08 => "Pointer is not an object boundary",
        DoubleFree = 0x09 => "Object is already free",
        CacheBusy = 0x0A => "Cache still has live objects",
        Corrupted = 0x0B => "Slab free chain is corrupt",
    }
}

/// Names a cache. The generation detects use after `cache_destroy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHandle {
    id: u16,
    generation: u32,
}

impl CacheHandle {
    pub fn id(self) -> u16 {
        self.id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub empty_slabs: usize,
    pub total_allocs: usize,
    pub total_frees: usize,
}

/// Result of [`SlabAllocator::verify`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlabReport {
    pub caches: usize,
    pub slabs: usize,
    pub objects_total: usize,
    pub objects_inuse: usize,
    /// Objects reachable from the slab free chains.
    pub objects_free: usize,
    pub errors: usize,
}

impl SlabReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

pub struct SlabAllocator {
    caches: [Option<SlabCache>; MAX_CACHES],
    generations: [u32; MAX_CACHES],
    /// Usable prefix of `caches`.
    capacity: usize,
    kmalloc: [Option<CacheHandle>; KMALLOC_CLASSES.len()],
    map: DirectMap,
}

impl SlabAllocator {
    /// An allocator with room for `capacity` caches (clamped to [`MAX_CACHES`]).
    pub const fn new(map: DirectMap, capacity: usize) -> Self {
        Self {
            caches: [const { None }; MAX_CACHES],
            generations: [0; MAX_CACHES],
            capacity: if capacity > MAX_CACHES { MAX_CACHES } else { capacity },
            kmalloc: [None; KMALLOC_CLASSES.len()],
            map,
        }
    }

    /// Create the `kalloc` size-class caches.
    pub fn init(&mut self) -> Result<(), SlabError> {
        for (class, (&size, &name)) in KMALLOC_CLASSES.iter().zip(&KMALLOC_NAMES).enumerate() {
            if self.kmalloc[class].is_none() {
                self.kmalloc[class] = Some(self.cache_create(name, size)?);
            }
        }
        log::info!(
            "[SLAB] {} size classes, {} cache slots",
            KMALLOC_CLASSES.len(),
            self.capacity
        );
        Ok(())
    }

    pub fn cache_create(&mut self, name: &'static str, size: usize) -> Result<CacheHandle, SlabError> {
        let slot = self.caches[..self.capacity]
            .iter()
            .position(Option::is_none)
            .ok_or(SlabError::NoCacheSlot)?;

        let generation = self.generations[slot].wrapping_add(1);
        let cache = SlabCache::new(name, slot as u16, generation, size, self.map)?;
        log::debug!(
            "[SLAB] cache {} ({} bytes, {} per slab) in slot {}",
            name,
            cache.object_size(),
            cache.objects_per_slab(),
            slot
        );
        self.generations[slot] = generation;
        self.caches[slot] = Some(cache);
        Ok(CacheHandle {
            id: slot as u16,
            generation,
        })
    }

    /// Destroy a cache whose objects are all free. The `kalloc` caches stay.
    pub fn cache_destroy(
        &mut self,
        handle: CacheHandle,
        frames: &dyn PageAllocator,
    ) -> Result<(), SlabError> {
        if self.kmalloc.contains(&Some(handle)) {
            return Err(SlabError::CacheBusy);
        }
        self.cache_mut(handle)?.destroy(frames)?;
        self.caches[usize::from(handle.id)] = None;
        Ok(())
    }

    pub fn cache_alloc(
        &mut self,
        handle: CacheHandle,
        frames: &dyn PageAllocator,
    ) -> Result<NonNull<u8>, SlabError> {
        self.cache_mut(handle)?.alloc(frames)
    }

    pub fn cache_free(
        &mut self,
        handle: CacheHandle,
        ptr: NonNull<u8>,
        frames: &dyn PageAllocator,
    ) -> Result<(), SlabError> {
        self.cache_mut(handle)?.free(ptr, frames)
    }

    pub fn cache(&self, handle: CacheHandle) -> Result<&SlabCache, SlabError> {
        self.caches
            .get(usize::from(handle.id))
            .and_then(Option::as_ref)
            .filter(|cache| cache.generation == handle.generation)
            .ok_or(SlabError::InvalidHandle)
    }

    fn cache_mut(&mut self, handle: CacheHandle) -> Result<&mut SlabCache, SlabError> {
        self.caches
            .get_mut(usize::from(handle.id))
            .and_then(Option::as_mut)
            .filter(|cache| cache.generation == handle.generation)
            .ok_or(SlabError::InvalidHandle)
    }

    /// General-purpose allocation of `size` bytes, 8-byte aligned.
    pub fn kalloc(&mut self, size: usize, frames: &dyn PageAllocator) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if let Some(class) = Self::size_to_class(size) {
            let handle = self.kmalloc[class]?;
            return match self.cache_alloc(handle, frames) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    log::error!("[SLAB] kalloc({size}) failed: {err}");
                    None
                }
            };
        }
        if size <= KMALLOC_MAX {
            let phys = frames.alloc_page()?;
            return NonNull::new(self.map.phys_to_virt(phys) as *mut u8);
        }
        log::warn!("[SLAB] kalloc({size}) exceeds {KMALLOC_MAX} bytes");
        None
    }

    /// Free memory from [`kalloc`](Self::kalloc).
    ///
    /// A frame-aligned pointer is a direct frame allocation; anything else
    /// must sit inside a live slab.
    pub fn kfree(&mut self, ptr: NonNull<u8>, frames: &dyn PageAllocator) -> Result<(), SlabError> {
        let addr = ptr.as_ptr() as usize;
        if addr % PAGE_SIZE == 0 {
            frames.free_page(self.map.virt_to_phys(addr));
            return Ok(());
        }

        // SAFETY: kalloc only hands out addresses inside mapped frames; the
        // magic is checked before the owner is trusted
        let header = unsafe { SlabHeader::containing(addr) };
        if !header.is_live() {
            return Err(SlabError::NotSlab);
        }
        let owner = CacheHandle {
            id: header.cache_id,
            generation: header.generation,
        };
        self.cache_mut(owner)
            .map_err(|_| SlabError::ForeignCache)?
            .free(ptr, frames)
    }

    /// Walk every slab of every cache and check the derived-state invariants.
    pub fn verify(&self) -> SlabReport {
        let mut report = SlabReport::default();
        for cache in self.caches.iter().flatten() {
            cache.verify(&mut report);
        }
        if report.objects_inuse + report.objects_free != report.objects_total {
            report.errors += 1;
        }
        report
    }

    pub fn stats(&self) -> impl Iterator<Item = CacheStats> + '_ {
        self.caches.iter().flatten().map(SlabCache::stats)
    }

    pub fn dump(&self) {
        for s in self.stats() {
            log::info!(
                "[SLAB] {:<12} obj {:4} per-slab {:3} slabs p/f/e {}/{}/{} allocs {} frees {}",
                s.name,
                s.object_size,
                s.objects_per_slab,
                s.partial_slabs,
                s.full_slabs,
                s.empty_slabs,
                s.total_allocs,
                s.total_frees
            );
        }
    }

    /// Map a request size to its `kalloc` cache.
    fn size_to_class(size: usize) -> Option<usize> {
        match size {
            0 => None,
            1..=32 => Some(0),
            33..=64 => Some(1),
            65..=128 => Some(2),
            129..=256 => Some(3),
            257..=512 => Some(4),
            513..=1024 => Some(5),
            1025..=2048 => Some(6),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, CountingFrames};
    use std::vec::Vec;

    fn allocator(map: DirectMap) -> SlabAllocator {
        let mut slab = SlabAllocator::new(map, 16);
        slab.init().unwrap();
        slab
    }

    #[test]
    fn test_size_to_class_mapping() {
        assert_eq!(SlabAllocator::size_to_class(1), Some(0));
        assert_eq!(SlabAllocator::size_to_class(32), Some(0));
        assert_eq!(SlabAllocator::size_to_class(33), Some(1));
        assert_eq!(SlabAllocator::size_to_class(128), Some(2));
        assert_eq!(SlabAllocator::size_to_class(1025), Some(6));
        assert_eq!(SlabAllocator::size_to_class(2048), Some(6));

        assert_eq!(SlabAllocator::size_to_class(0), None);
        assert_eq!(SlabAllocator::size_to_class(2049), None);
    }

    #[test]
    fn test_kmalloc_classes_fit_one_frame() {
        for size in KMALLOC_CLASSES {
            assert!(DATA_SIZE / size >= 1, "class {size}");
        }
    }

    #[test]
    fn test_cache_create_first_alloc_takes_one_frame() {
        let (host, inner) = testing::frames(32);
        let frames = CountingFrames::new(inner);
        let mut slab = allocator(host.map);

        let handle = slab.cache_create("obj24", 24).unwrap();
        assert_eq!(slab.cache(handle).unwrap().objects_per_slab(), 169);
        assert_eq!(frames.allocs(), 0);

        let _ = slab.cache_alloc(handle, &frames).unwrap();
        assert_eq!(frames.allocs(), 1);
    }

    #[test]
    fn test_kalloc_routes_by_size() {
        let (host, frames) = testing::frames(32);
        let mut slab = allocator(host.map);

        let small = slab.kalloc(1, &frames).unwrap();
        let mid = slab.kalloc(700, &frames).unwrap();
        let page = slab.kalloc(3000, &frames).unwrap();
        assert_ne!(small.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(small.as_ptr() as usize % MIN_ALIGN, 0);
        assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(slab.kalloc(PAGE_SIZE + 1, &frames).is_none());
        assert!(slab.kalloc(0, &frames).is_none());

        let used = 32 - frames.stats().free;
        assert_eq!(used, 3);

        slab.kfree(page, &frames).unwrap();
        slab.kfree(mid, &frames).unwrap();
        slab.kfree(small, &frames).unwrap();

        // Emptied slabs stay cached, one per cache.
        assert_eq!(32 - frames.stats().free, 2);
        assert!(slab.verify().is_clean());
    }

    #[test]
    fn test_kfree_rejects_garbage() {
        let (host, frames) = testing::frames(32);
        let mut slab = allocator(host.map);

        // An interior pointer of a direct frame has no slab header.
        let page = slab.kalloc(4096, &frames).unwrap();
        let inside = NonNull::new(page.as_ptr().wrapping_add(64)).unwrap();
        assert_eq!(slab.kfree(inside, &frames), Err(SlabError::NotSlab));

        let obj = slab.kalloc(100, &frames).unwrap();
        slab.kfree(obj, &frames).unwrap();
        assert_eq!(slab.kfree(obj, &frames), Err(SlabError::DoubleFree));
    }

    #[test]
    fn test_cache_free_with_wrong_handle_is_reported() {
        let (host, frames) = testing::frames(32);
        let mut slab = allocator(host.map);
        let a = slab.cache_create("a", 48).unwrap();
        let b = slab.cache_create("b", 48).unwrap();

        let obj = slab.cache_alloc(a, &frames).unwrap();
        assert_eq!(slab.cache_free(b, obj, &frames), Err(SlabError::ForeignCache));
        assert_eq!(slab.cache(a).unwrap().stats().partial_slabs, 1);
        slab.cache_free(a, obj, &frames).unwrap();
    }

    #[test]
    fn test_destroy_and_stale_handles() {
        let (host, frames) = testing::frames(32);
        let mut slab = allocator(host.map);
        let handle = slab.cache_create("tmp", 200).unwrap();

        let obj = slab.cache_alloc(handle, &frames).unwrap();
        assert_eq!(slab.cache_destroy(handle, &frames), Err(SlabError::CacheBusy));
        slab.cache_free(handle, obj, &frames).unwrap();
        slab.cache_destroy(handle, &frames).unwrap();
        assert_eq!(frames.stats().free, 32);

        assert_eq!(slab.cache_alloc(handle, &frames), Err(SlabError::InvalidHandle));

        // The slot is reused under a new generation.
        let again = slab.cache_create("tmp2", 200).unwrap();
        assert_eq!(again.id(), handle.id());
        assert_ne!(again, handle);
    }

    #[test]
    fn test_kmalloc_caches_cannot_be_destroyed() {
        let (host, frames) = testing::frames(8);
        let mut slab = allocator(host.map);
        let handle = slab.kmalloc[0].unwrap();
        assert_eq!(slab.cache_destroy(handle, &frames), Err(SlabError::CacheBusy));
    }

    #[test]
    fn test_cache_table_capacity() {
        let mut slab = SlabAllocator::new(DirectMap::IDENTITY, KMALLOC_CLASSES.len() + 1);
        slab.init().unwrap();
        slab.cache_create("last", 64).unwrap();
        assert_eq!(slab.cache_create("one-too-many", 64), Err(SlabError::NoCacheSlot));
    }

    #[test]
    fn test_verify_after_mixed_sequence() {
        let (host, frames) = testing::frames(64);
        let mut slab = allocator(host.map);
        let handle = slab.cache_create("obj24", 24).unwrap();

        let mut live = Vec::new();
        for i in 0..600 {
            live.push(slab.cache_alloc(handle, &frames).unwrap());
            if i % 3 == 0 {
                let victim = live.swap_remove(i % live.len());
                slab.cache_free(handle, victim, &frames).unwrap();
            }
        }
        for size in [10, 40, 90, 300, 600, 1500] {
            let ptr = slab.kalloc(size, &frames).unwrap();
            slab.kfree(ptr, &frames).unwrap();
        }

        let report = slab.verify();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.objects_inuse, live.len());
        assert_eq!(report.objects_inuse, report.objects_total - report.objects_free);

        for ptr in live.drain(..) {
            slab.cache_free(handle, ptr, &frames).unwrap();
        }
        let report = slab.verify();
        assert!(report.is_clean());
        assert_eq!(report.objects_inuse, 0);
        assert_eq!(slab.cache(handle).unwrap().stats().empty_slabs, 1);
    }
}
