//! Seams between the memory components.

/// Physical frame source used by the slab allocator, the page table manager
/// and the vmalloc area.
///
/// Addresses are physical and aligned to the block size. Blocks are
/// `2^order` contiguous 4 KiB frames.
pub trait PageAllocator: Send + Sync {
    /// Allocate a block of `2^order` frames.
    fn alloc_pages(&self, order: usize) -> Option<usize>;

    /// Return a block obtained from [`alloc_pages`](Self::alloc_pages) with the same order.
    fn free_pages(&self, pa: usize, order: usize);

    /// Allocate a single 4 KiB frame.
    fn alloc_page(&self) -> Option<usize> {
        self.alloc_pages(0)
    }

    /// Free a single 4 KiB frame.
    fn free_page(&self, pa: usize) {
        self.free_pages(pa, 0);
    }
}
