//! Layout of one slab frame: a 40-byte header followed by equal-sized objects.
//!
//! Free objects are chained by index: the first two bytes of a free object
//! hold the index of the next free object, or [`FREE_END`]. Indices are
//! bounds-checked on every pop, so a scribbled chain cannot send the allocator
//! outside its frame.

use crate::allocator::PAGE_SIZE;
use rvk_utils::Link;

/// Marks a frame as a live slab.
pub const SLAB_MAGIC: u32 = 0x51AB_C0DE;
pub const HEADER_SIZE: usize = 40;
/// Terminates the free chain.
pub const FREE_END: u16 = u16::MAX;
/// Bytes available for objects in one frame.
pub const DATA_SIZE: usize = PAGE_SIZE - HEADER_SIZE;

#[repr(C)]
#[derive(Debug)]
pub struct SlabHeader {
    pub magic: u32,
    /// Slot of the owning cache.
    pub cache_id: u16,
    _reserved: u16,
    /// Generation of the owning cache slot when the slab was created.
    pub generation: u32,
    pub object_size: u32,
    pub inuse: u16,
    pub total: u16,
    pub free_head: u16,
    _pad: u16,
    /// Links on the owning cache's partial/full/empty list, by frame number.
    pub link: Link,
    /// Physical address of this frame.
    pub phys: u64,
}

const _: () = assert!(size_of::<SlabHeader>() == HEADER_SIZE);

impl SlabHeader {
    /// Write a fresh header at the frame mapped at `base` and chain all objects.
    ///
    /// # Safety
    /// `base` must be the page-aligned virtual address of a frame owned by the
    /// caller, and `HEADER_SIZE + total * object_size <= PAGE_SIZE`.
    pub unsafe fn init<'a>(
        base: usize,
        phys: usize,
        cache_id: u16,
        generation: u32,
        object_size: usize,
        total: u16,
    ) -> &'a mut SlabHeader {
        let header = base as *mut SlabHeader;
        header.write(SlabHeader {
            magic: SLAB_MAGIC,
            cache_id,
            _reserved: 0,
            generation,
            object_size: object_size as u32,
            inuse: 0,
            total,
            free_head: 0,
            _pad: 0,
            link: Link::UNLINKED,
            phys: phys as u64,
        });

        let header = &mut *header;
        for index in 0..total {
            let next = if index + 1 == total { FREE_END } else { index + 1 };
            (header.object_addr(index) as *mut u16).write(next);
        }
        header
    }

    /// Header of the frame containing `addr`.
    ///
    /// # Safety
    /// The containing frame must be mapped and owned by the slab allocator or
    /// at least readable; the magic must be checked before trusting any field.
    pub unsafe fn containing<'a>(addr: usize) -> &'a mut SlabHeader {
        &mut *(rvk_utils::align_down(addr, PAGE_SIZE) as *mut SlabHeader)
    }

    #[inline]
    fn base(&self) -> usize {
        self as *const Self as usize
    }

    pub fn is_live(&self) -> bool {
        self.magic == SLAB_MAGIC
    }

    pub fn is_full(&self) -> bool {
        self.inuse == self.total
    }

    pub fn is_empty(&self) -> bool {
        self.inuse == 0
    }

    pub fn object_addr(&self, index: u16) -> usize {
        self.base() + HEADER_SIZE + usize::from(index) * self.object_size as usize
    }

    /// Index of the object starting exactly at `addr`.
    pub fn object_index(&self, addr: usize) -> Option<u16> {
        let offset = addr.checked_sub(self.base() + HEADER_SIZE)?;
        let size = self.object_size as usize;
        if size == 0 || offset % size != 0 {
            return None;
        }
        let index = offset / size;
        (index < usize::from(self.total)).then_some(index as u16)
    }

    /// Take the first free object.
    pub fn pop_object(&mut self) -> Option<usize> {
        if self.free_head == FREE_END || self.free_head >= self.total {
            return None;
        }
        let addr = self.object_addr(self.free_head);
        // SAFETY: addr lies inside this frame and the object is free
        let next = unsafe { (addr as *const u16).read() };
        if next != FREE_END && next >= self.total {
            log::error!(
                "[SLAB] free chain of slab {:#x} points at object {next}",
                self.phys
            );
            self.free_head = FREE_END;
        } else {
            self.free_head = next;
        }
        self.inuse += 1;
        Some(addr)
    }

    /// Put object `index` back at the front of the free chain.
    pub fn push_object(&mut self, index: u16) {
        let addr = self.object_addr(index);
        // SAFETY: index < total was checked by object_index
        unsafe { (addr as *mut u16).write(self.free_head) };
        self.free_head = index;
        self.inuse -= 1;
    }

    /// Length of the free chain, or `None` if it leaves the slab or loops.
    pub fn free_chain_len(&self) -> Option<usize> {
        let mut count = 0;
        let mut cursor = self.free_head;
        while cursor != FREE_END {
            if cursor >= self.total || count >= usize::from(self.total) {
                return None;
            }
            count += 1;
            // SAFETY: cursor < total
            cursor = unsafe { (self.object_addr(cursor) as *const u16).read() };
        }
        Some(count)
    }

    /// Whether object `index` is on the free chain.
    pub fn is_free_object(&self, index: u16) -> bool {
        let mut cursor = self.free_head;
        let mut steps = 0;
        while cursor != FREE_END && cursor < self.total && steps < self.total {
            if cursor == index {
                return true;
            }
            steps += 1;
            // SAFETY: cursor < total
            cursor = unsafe { (self.object_addr(cursor) as *const u16).read() };
        }
        false
    }
}
