//! Physical frame (buddy) and kernel object (slab) allocators.

pub mod buddy;
pub mod page;
pub mod slab;

pub use buddy::{
    BuddyAllocator, FrameError, MAX_ORDER, NR_ORDERS, PAGE_SHIFT, PAGE_SIZE, order_for_pages,
};
pub use page::{Page, PhysPageFlags};
pub use slab::{CacheHandle, CacheStats, SlabAllocator, SlabError, SlabReport};
