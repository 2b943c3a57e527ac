use super::page::Page;
use rvk_error::define_kernel_error;
use rvk_utils::IndexList;

/// Largest block order (inclusive): 2^11 frames = 8 MiB.
pub const MAX_ORDER: usize = 11;
/// Number of free lists, one per order in `0..=MAX_ORDER`.
pub const NR_ORDERS: usize = MAX_ORDER + 1;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Smallest order whose block holds at least `pages` frames.
pub const fn order_for_pages(pages: usize) -> usize {
    if pages <= 1 {
        0
    } else {
        (usize::BITS - (pages - 1).leading_zeros()) as usize
    }
}

define_kernel_error! {
    /// Frame allocator errors (0x02xx)
    pub enum FrameError(0x02) {
        /// No block of the requested order or larger is free
        OutOfMemory = 0x01 => "No free block of sufficient order",
        /// Order above MAX_ORDER
        BadOrder = 0x02 => "Order out of range",
        /// Zero, unaligned or outside the managed range
        InvalidAddress = 0x03 => "Address not managed by the frame allocator",
        /// Tail frame or reserved frame
        NotHead = 0x04 => "Address is not the head of an allocated block",
        DoubleFree = 0x05 => "Block is already free",
        OrderMismatch = 0x06 => "Order differs from the allocated order",
        RefcountOverflow = 0x07 => "Reference count saturated",
        Uninitialized = 0x08 => "Frame allocator has no descriptor table",
    }
}

/// Buddy allocator over one contiguous physical range.
///
/// Free lists hold descriptor indices; block `i` of order `o` covers frames
/// `i..i + 2^o`. A block's buddy is found by flipping bit `o` of its absolute
/// frame number, so blocks are aligned to their own size in physical memory.
pub struct BuddyAllocator {
    /// `free_lists[o]` holds the heads of free blocks of order `o`.
    free_lists: [IndexList; NR_ORDERS],

    /// One descriptor per managed frame.
    mem_map: Option<&'static mut [Page]>,

    /// Physical address corresponding to the first entry in mem_map.
    phys_base: usize,

    free_frames: usize,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    /// Create a new, uninitialized buddy allocator.
    pub const fn new() -> Self {
        Self {
            free_lists: [const { IndexList::new() }; NR_ORDERS],
            mem_map: None,
            phys_base: 0,
            free_frames: 0,
        }
    }

    /// Take ownership of a descriptor table covering
    /// `phys_base..phys_base + mem_map.len() * PAGE_SIZE`.
    ///
    /// Every frame starts reserved; [`add_range`](Self::add_range) releases
    /// the usable parts.
    ///
    /// # Safety
    /// `phys_base` must be page-aligned and the described frames must not be
    /// in use by anything else once they are added.
    pub unsafe fn init(&mut self, mem_map: &'static mut [Page], phys_base: usize) {
        mem_map.fill(Page::reserved());
        self.free_lists = [const { IndexList::new() }; NR_ORDERS];
        self.mem_map = Some(mem_map);
        self.phys_base = phys_base;
        self.free_frames = 0;
    }

    /// Release `start_pa..end_pa` (clipped to the descriptor table) as free
    /// blocks, largest aligned block first. Returns the number of frames added.
    ///
    /// # Safety
    /// The range must be real, otherwise unused RAM.
    pub unsafe fn add_range(&mut self, start_pa: usize, end_pa: usize) -> usize {
        let Some(mem_map) = self.mem_map.as_deref_mut() else {
            return 0;
        };
        let managed_end = self.phys_base + mem_map.len() * PAGE_SIZE;
        let start = rvk_utils::align_up(start_pa.max(self.phys_base), PAGE_SIZE);
        let end = rvk_utils::align_down(end_pa.min(managed_end), PAGE_SIZE);
        if start >= end {
            return 0;
        }

        let first = (start - self.phys_base) / PAGE_SIZE;
        let last = (end - self.phys_base) / PAGE_SIZE;
        mem_map[first..last].fill(Page::tail());

        let mut curr_pa = start;
        while curr_pa < end {
            // Largest order that fits and is aligned
            let mut order = MAX_ORDER;
            while order > 0 {
                let size = PAGE_SIZE << order;
                if curr_pa + size <= end && curr_pa % size == 0 {
                    break;
                }
                order -= 1;
            }

            self.insert_block((curr_pa - self.phys_base) / PAGE_SIZE, order);
            self.free_frames += 1 << order;
            curr_pa += PAGE_SIZE << order;
        }

        last - first
    }

    /// Allocate a block of `2^order` frames.
    ///
    /// Takes the first free block of the smallest sufficient order and splits
    /// it, pushing each upper half onto its own free list.
    pub fn alloc(&mut self, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            return None;
        }
        let mem_map = self.mem_map.as_deref_mut()?;

        let found = (order..NR_ORDERS).find(|&o| !self.free_lists[o].is_empty())?;
        let index = self.free_lists[found].pop_front(mem_map)? as usize;

        for j in (order..found).rev() {
            let buddy = index + (1 << j);
            mem_map[buddy].mark_free(j);
            self.free_lists[j].push_front(mem_map, buddy as u32);
        }

        mem_map[index].mark_used(order);
        self.free_frames -= 1 << order;
        Some(self.phys_base + index * PAGE_SIZE)
    }

    /// Drop one reference to the block at `pa`; release it when none remain.
    ///
    /// The request is validated first: the address must be the head of a used
    /// block allocated with the same `order`. A rejected request changes
    /// nothing.
    pub fn free(&mut self, pa: usize, order: usize) -> Result<(), FrameError> {
        if order > MAX_ORDER {
            return Err(FrameError::BadOrder);
        }
        let index = self.head_index(pa)?;
        let mem_map = self.mem_map.as_deref_mut().ok_or(FrameError::Uninitialized)?;
        let page = &mut mem_map[index];
        if page.order as usize != order {
            return Err(FrameError::OrderMismatch);
        }

        page.refcount = page.refcount.saturating_sub(1);
        if page.refcount > 0 {
            return Ok(());
        }

        self.insert_block(index, order);
        self.free_frames += 1 << order;
        Ok(())
    }

    /// Add an owner to the used block at `pa`. Returns the new count.
    pub fn share(&mut self, pa: usize) -> Result<u16, FrameError> {
        let index = self.head_index(pa)?;
        let mem_map = self.mem_map.as_deref_mut().ok_or(FrameError::Uninitialized)?;
        let page = &mut mem_map[index];
        page.refcount = page
            .refcount
            .checked_add(1)
            .ok_or(FrameError::RefcountOverflow)?;
        Ok(page.refcount)
    }

    /// Reference count of the used block at `pa`.
    pub fn refcount(&self, pa: usize) -> Result<u16, FrameError> {
        let index = self.head_index(pa)?;
        let mem_map = self.mem_map.as_deref().ok_or(FrameError::Uninitialized)?;
        Ok(mem_map[index].refcount)
    }

    /// Number of frames covered by the descriptor table.
    pub fn total_frames(&self) -> usize {
        self.mem_map.as_deref().map_or(0, <[Page]>::len)
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Number of free blocks of exactly `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, IndexList::len)
    }

    /// Frames reachable from the free lists. Equals [`free_frames`](Self::free_frames)
    /// unless the lists are corrupt.
    pub fn free_list_frames(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }

    pub fn phys_base(&self) -> usize {
        self.phys_base
    }

    pub fn dump(&self) {
        log::info!(
            "[BUDDY] {} of {} frames free",
            self.free_frames,
            self.total_frames()
        );
        for (order, list) in self.free_lists.iter().enumerate() {
            if !list.is_empty() {
                log::info!("[BUDDY]   order {:2}: {} blocks", order, list.len());
            }
        }
    }

    /// Descriptor index of the used block head at `pa`.
    fn head_index(&self, pa: usize) -> Result<usize, FrameError> {
        if pa == 0 || pa % PAGE_SIZE != 0 {
            return Err(FrameError::InvalidAddress);
        }
        let mem_map = self.mem_map.as_deref().ok_or(FrameError::Uninitialized)?;
        let index = pa
            .checked_sub(self.phys_base)
            .map(|offset| offset / PAGE_SIZE)
            .filter(|&index| index < mem_map.len())
            .ok_or(FrameError::InvalidAddress)?;

        let page = &mem_map[index];
        if page.is_free() {
            Err(FrameError::DoubleFree)
        } else if !page.is_head() || !page.is_used() {
            Err(FrameError::NotHead)
        } else {
            Ok(index)
        }
    }

    /// Put the block at `index` on a free list, merging with free buddies.
    fn insert_block(&mut self, mut index: usize, mut order: usize) {
        let Some(mem_map) = self.mem_map.as_deref_mut() else {
            return;
        };
        let base_pfn = self.phys_base / PAGE_SIZE;
        let len = mem_map.len();

        while order < MAX_ORDER {
            let buddy_pfn = (base_pfn + index) ^ (1 << order);
            let Some(buddy) = buddy_pfn.checked_sub(base_pfn).filter(|&b| b < len) else {
                break;
            };
            let page = &mem_map[buddy];
            if !(page.is_free() && page.is_head() && page.order as usize == order) {
                break;
            }

            self.free_lists[order].remove(mem_map, buddy as u32);
            mem_map[index.max(buddy)] = Page::tail();
            index = index.min(buddy);
            order += 1;
        }

        mem_map[index].mark_free(order);
        self.free_lists[order].push_front(mem_map, index as u32);
    }
}
