use super::page::{DATA_SIZE, SlabHeader};
use super::{CacheStats, SlabError, SlabReport};
use crate::allocator::PAGE_SHIFT;
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use core::ptr::NonNull;
use rvk_utils::{IndexList, Link, LinkArena};

/// Slab lists are chained through the headers of their frames, indexed by
/// frame number.
struct SlabArena {
    map: DirectMap,
}

impl SlabArena {
    fn header(&self, pfn: u32) -> *mut SlabHeader {
        self.map.as_mut_ptr((pfn as usize) << PAGE_SHIFT)
    }
}

impl LinkArena for SlabArena {
    fn link(&self, pfn: u32) -> Link {
        // SAFETY: only frame numbers of live slabs are put on a list
        unsafe { (*self.header(pfn)).link }
    }

    fn set_link(&mut self, pfn: u32, link: Link) {
        // SAFETY: as above
        unsafe { (*self.header(pfn)).link = link };
    }
}

/// Objects of one size, carved out of single-frame slabs.
///
/// # Lists
/// - `partial`: slabs with some free objects (allocation target)
/// - `full`: slabs with all objects allocated
/// - `empty`: at most one slab with no objects allocated; further empty slabs
///   go straight back to the frame allocator
pub struct SlabCache {
    name: &'static str,
    pub(super) id: u16,
    pub(super) generation: u32,
    object_size: usize,
    objects_per_slab: usize,

    partial: IndexList,
    full: IndexList,
    empty: IndexList,

    arena: SlabArena,

    total_allocs: usize,
    total_frees: usize,
}

impl SlabCache {
    /// Describe a cache of `size`-byte objects. No frame is taken until the
    /// first allocation.
    pub fn new(
        name: &'static str,
        id: u16,
        generation: u32,
        size: usize,
        map: DirectMap,
    ) -> Result<Self, SlabError> {
        if size == 0 {
            return Err(SlabError::InvalidSize);
        }
        let object_size = size
            .checked_next_multiple_of(super::MIN_ALIGN)
            .ok_or(SlabError::TooLarge)?;
        let objects_per_slab = DATA_SIZE / object_size;
        if objects_per_slab == 0 {
            return Err(SlabError::TooLarge);
        }

        Ok(Self {
            name,
            id,
            generation,
            object_size,
            objects_per_slab,
            partial: IndexList::new(),
            full: IndexList::new(),
            empty: IndexList::new(),
            arena: SlabArena { map },
            total_allocs: 0,
            total_frees: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    /// Allocate an object.
    ///
    /// Partial slabs first, then the cached empty slab, then a fresh frame.
    pub fn alloc(&mut self, frames: &dyn PageAllocator) -> Result<NonNull<u8>, SlabError> {
        let pfn = if let Some(pfn) = self.partial.head() {
            pfn
        } else if let Some(pfn) = self.empty.pop_front(&mut self.arena) {
            self.partial.push_front(&mut self.arena, pfn);
            pfn
        } else {
            self.grow(frames)?
        };

        // SAFETY: pfn is a live slab of this cache
        let header = unsafe { &mut *self.arena.header(pfn) };
        let Some(addr) = header.pop_object() else {
            // Nothing more can come out of this slab; park it on `full` so the
            // next allocation moves on.
            log::error!("[SLAB] {}: slab at {:#x} has a broken free chain", self.name, header.phys);
            self.partial.remove(&mut self.arena, pfn);
            self.full.push_front(&mut self.arena, pfn);
            return Err(SlabError::Corrupted);
        };
        let full = header.is_full();

        if full {
            self.partial.remove(&mut self.arena, pfn);
            self.full.push_front(&mut self.arena, pfn);
        }
        self.total_allocs += 1;
        NonNull::new(addr as *mut u8).ok_or(SlabError::Corrupted)
    }

    /// Return `ptr` to its slab.
    ///
    /// The slab is found by masking `ptr` to its frame. The slab header must
    /// name this cache, `ptr` must be an object boundary, and the object must
    /// be in use; otherwise nothing changes.
    pub fn free(&mut self, ptr: NonNull<u8>, frames: &dyn PageAllocator) -> Result<(), SlabError> {
        let addr = ptr.as_ptr() as usize;
        // SAFETY: the caller hands in a pointer inside a mapped frame; the
        // magic is checked before anything else is trusted
        let header = unsafe { SlabHeader::containing(addr) };
        if !header.is_live() {
            return Err(SlabError::NotSlab);
        }
        if header.cache_id != self.id || header.generation != self.generation {
            return Err(SlabError::ForeignCache);
        }
        let index = header.object_index(addr).ok_or(SlabError::BadPointer)?;
        if header.is_free_object(index) {
            return Err(SlabError::DoubleFree);
        }

        let was_full = header.is_full();
        header.push_object(index);
        let now_empty = header.is_empty();
        let pfn = (header.phys >> PAGE_SHIFT) as u32;
        self.total_frees += 1;

        match (was_full, now_empty) {
            (true, false) => {
                self.full.remove(&mut self.arena, pfn);
                self.partial.push_front(&mut self.arena, pfn);
            }
            (true, true) => {
                self.full.remove(&mut self.arena, pfn);
                self.retire(pfn, frames);
            }
            (false, true) => {
                self.partial.remove(&mut self.arena, pfn);
                self.retire(pfn, frames);
            }
            (false, false) => {}
        }
        Ok(())
    }

    /// Hand every frame back. Refused while any object is live.
    pub fn destroy(&mut self, frames: &dyn PageAllocator) -> Result<(), SlabError> {
        if !self.partial.is_empty() || !self.full.is_empty() {
            return Err(SlabError::CacheBusy);
        }
        while let Some(pfn) = self.empty.pop_front(&mut self.arena) {
            self.release(pfn, frames);
        }
        Ok(())
    }

    /// Check every slab on every list; add the findings to `report`.
    pub fn verify(&self, report: &mut SlabReport) {
        report.caches += 1;
        if self.empty.len() > 1 {
            log::error!("[SLAB] {}: {} empty slabs cached", self.name, self.empty.len());
            report.errors += 1;
        }

        let lists = [
            (&self.partial, SlabState::Partial),
            (&self.full, SlabState::Full),
            (&self.empty, SlabState::Empty),
        ];
        for (list, state) in lists {
            let mut seen = 0;
            for pfn in list.iter(&self.arena) {
                seen += 1;
                if seen > list.len() {
                    log::error!("[SLAB] {}: {:?} list loops", self.name, state);
                    report.errors += 1;
                    break;
                }
                // SAFETY: pfn is on one of our lists
                let header = unsafe { &*self.arena.header(pfn) };
                report.slabs += 1;
                if !self.check_slab(header, state, report) {
                    report.errors += 1;
                }
            }
        }
    }

    fn check_slab(&self, header: &SlabHeader, state: SlabState, report: &mut SlabReport) -> bool {
        if !header.is_live()
            || header.cache_id != self.id
            || header.generation != self.generation
            || usize::from(header.total) != self.objects_per_slab
        {
            log::error!("[SLAB] {}: slab {:#x} has a bad header", self.name, header.phys);
            return false;
        }

        let Some(free) = header.free_chain_len() else {
            log::error!("[SLAB] {}: slab {:#x} has a broken free chain", self.name, header.phys);
            return false;
        };
        let total = usize::from(header.total);
        let inuse = usize::from(header.inuse);
        report.objects_total += total;
        report.objects_inuse += inuse;
        report.objects_free += free;

        if inuse + free != total {
            log::error!(
                "[SLAB] {}: slab {:#x} inuse {} + free {} != {}",
                self.name,
                header.phys,
                inuse,
                free,
                total
            );
            return false;
        }

        let state_ok = match state {
            SlabState::Partial => inuse > 0 && inuse < total,
            SlabState::Full => inuse == total,
            SlabState::Empty => inuse == 0,
        };
        if !state_ok {
            log::error!(
                "[SLAB] {}: slab {:#x} with {}/{} in use is on the {:?} list",
                self.name,
                header.phys,
                inuse,
                total,
                state
            );
        }
        state_ok
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name,
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab,
            partial_slabs: self.partial.len(),
            full_slabs: self.full.len(),
            empty_slabs: self.empty.len(),
            total_allocs: self.total_allocs,
            total_frees: self.total_frees,
        }
    }

    /// Take a fresh frame and put it on the partial list.
    fn grow(&mut self, frames: &dyn PageAllocator) -> Result<u32, SlabError> {
        let phys = frames.alloc_page().ok_or(SlabError::OutOfMemory)?;
        let base = self.arena.map.phys_to_virt(phys);
        // SAFETY: the frame was just handed to us and holds objects_per_slab objects
        unsafe {
            SlabHeader::init(
                base,
                phys,
                self.id,
                self.generation,
                self.object_size,
                self.objects_per_slab as u16,
            );
        }
        let pfn = (phys >> PAGE_SHIFT) as u32;
        self.partial.push_front(&mut self.arena, pfn);
        log::trace!("[SLAB] {}: new slab at {:#x}", self.name, phys);
        Ok(pfn)
    }

    /// An unlinked slab just became empty: keep it if the empty slot is free,
    /// otherwise give the frame back.
    fn retire(&mut self, pfn: u32, frames: &dyn PageAllocator) {
        if self.empty.is_empty() {
            self.empty.push_front(&mut self.arena, pfn);
        } else {
            self.release(pfn, frames);
        }
    }

    fn release(&mut self, pfn: u32, frames: &dyn PageAllocator) {
        // SAFETY: pfn was a slab of this cache and is on no list now
        let header = unsafe { &mut *self.arena.header(pfn) };
        header.magic = 0;
        let phys = header.phys as usize;
        frames.free_page(phys);
        log::trace!("[SLAB] {}: released slab at {:#x}", self.name, phys);
    }
}

#[derive(Clone, Copy, Debug)]
enum SlabState {
    Partial,
    Full,
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::slab::page::FREE_END;
    use crate::testing::{self, CountingFrames};

    #[test]
    fn test_objects_per_slab() {
        let map = DirectMap::IDENTITY;
        let cache = SlabCache::new("obj24", 0, 1, 24, map).unwrap();
        assert_eq!(cache.object_size(), 24);
        assert_eq!(cache.objects_per_slab(), 169);

        let cache = SlabCache::new("odd", 0, 1, 13, map).unwrap();
        assert_eq!(cache.object_size(), 16);

        assert_eq!(SlabCache::new("big", 0, 1, DATA_SIZE + 1, map).err(), Some(SlabError::TooLarge));
        assert_eq!(SlabCache::new("zero", 0, 1, 0, map).err(), Some(SlabError::InvalidSize));
    }

    #[test]
    fn test_one_frame_per_slab_worth_of_objects() {
        let (host, inner) = testing::frames(16);
        let frames = CountingFrames::new(inner);
        let mut cache = SlabCache::new("obj24", 0, 1, 24, host.map).unwrap();

        let _ = cache.alloc(&frames).unwrap();
        assert_eq!(frames.allocs(), 1);

        for _ in 1..169 {
            let _ = cache.alloc(&frames).unwrap();
        }
        assert_eq!(frames.allocs(), 1);
        assert_eq!(cache.stats().full_slabs, 1);

        let _ = cache.alloc(&frames).unwrap();
        assert_eq!(frames.allocs(), 2);
    }

    #[test]
    fn test_state_transitions_keep_one_empty_slab() {
        let (host, inner) = testing::frames(16);
        let frames = CountingFrames::new(inner);
        // 2048-byte objects: one per slab, so every free empties a slab.
        let mut cache = SlabCache::new("size-2048", 0, 1, 2048, host.map).unwrap();
        assert_eq!(cache.objects_per_slab(), 1);

        let a = cache.alloc(&frames).unwrap();
        let b = cache.alloc(&frames).unwrap();
        let c = cache.alloc(&frames).unwrap();
        assert_eq!(cache.stats().full_slabs, 3);

        cache.free(a, &frames).unwrap();
        assert_eq!(cache.stats().empty_slabs, 1);
        assert_eq!(frames.frees(), 0);

        cache.free(b, &frames).unwrap();
        cache.free(c, &frames).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (0, 0, 1));
        assert_eq!(frames.frees(), 2);

        // The cached empty slab is reused before a new frame is taken.
        let _ = cache.alloc(&frames).unwrap();
        assert_eq!(frames.allocs(), 3);
    }

    #[test]
    fn test_free_rejects_bad_requests() {
        let (host, frames) = testing::frames(16);
        let mut mine = SlabCache::new("mine", 1, 1, 64, host.map).unwrap();
        let mut other = SlabCache::new("other", 2, 1, 64, host.map).unwrap();

        let obj = mine.alloc(&frames).unwrap();
        let theirs = other.alloc(&frames).unwrap();

        assert_eq!(mine.free(theirs, &frames), Err(SlabError::ForeignCache));
        let inside = NonNull::new(obj.as_ptr().wrapping_add(8)).unwrap();
        assert_eq!(mine.free(inside, &frames), Err(SlabError::BadPointer));

        mine.free(obj, &frames).unwrap();
        // The slab is now the cached empty one; a second free is caught.
        assert_eq!(mine.free(obj, &frames), Err(SlabError::DoubleFree));

        let mut report = SlabReport::default();
        mine.verify(&mut report);
        other.verify(&mut report);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_destroy_requires_all_objects_free() {
        let (host, frames) = testing::frames(16);
        let mut cache = SlabCache::new("tmp", 0, 1, 128, host.map).unwrap();

        let obj = cache.alloc(&frames).unwrap();
        assert_eq!(cache.destroy(&frames), Err(SlabError::CacheBusy));

        cache.free(obj, &frames).unwrap();
        cache.destroy(&frames).unwrap();
        assert_eq!(frames.stats().free, 16);
    }

    #[test]
    fn test_broken_free_chain_is_parked() {
        let (host, frames) = testing::frames(16);
        let mut cache = SlabCache::new("chain", 0, 1, 64, host.map).unwrap();

        let first = cache.alloc(&frames).unwrap();
        // SAFETY: first lives in a slab frame of this cache
        let header = unsafe { SlabHeader::containing(first.as_ptr() as usize) };
        header.free_head = FREE_END;

        assert_eq!(cache.alloc(&frames), Err(SlabError::Corrupted));
        let stats = cache.stats();
        assert_eq!((stats.partial_slabs, stats.full_slabs), (0, 1));

        let second = cache.alloc(&frames).unwrap();
        assert_ne!(first.as_ptr() as usize >> PAGE_SHIFT, second.as_ptr() as usize >> PAGE_SHIFT);
        assert_eq!(cache.stats().partial_slabs, 1);
    }

    #[test]
    fn test_grow_reports_frame_exhaustion() {
        let (host, inner) = testing::frames(16);
        let frames = CountingFrames::new(inner);
        frames.fail_after(0);
        let mut cache = SlabCache::new("starved", 0, 1, 32, host.map).unwrap();
        assert_eq!(cache.alloc(&frames), Err(SlabError::OutOfMemory));
    }
}
