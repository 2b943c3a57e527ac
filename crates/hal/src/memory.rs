//! Frame allocator shared by the rest of the memory subsystem.

use crate::IrqSafeLock;
use crate::allocator::{BuddyAllocator, FrameError, MAX_ORDER, PAGE_SIZE, Page};
use crate::config::{CorruptionPolicy, MmConfig};
use crate::mm::MmError;
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use rvk_utils::div_round_up;

/// Total and free frame counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
}

/// Interrupt-safe wrapper around [`BuddyAllocator`].
///
/// Rejected frees are handed to the [`CorruptionPolicy`] after the lock is
/// released.
pub struct FrameAllocator {
    buddy: IrqSafeLock<BuddyAllocator>,
    policy: CorruptionPolicy,
}

impl FrameAllocator {
    pub const fn new(buddy: BuddyAllocator, policy: CorruptionPolicy) -> Self {
        Self {
            buddy: IrqSafeLock::new(buddy),
            policy,
        }
    }

    /// Build the allocator for the RAM described by `config`.
    ///
    /// The descriptor table is placed at the start of the managed range
    /// (right after the kernel image) and its frames stay reserved. The first
    /// free frame is kept on an even frame number so order-1 blocks can form
    /// from the start.
    ///
    /// # Safety
    /// The managed range must be unused RAM reachable through `map`.
    pub unsafe fn from_config(config: &MmConfig, map: DirectMap) -> Result<Self, MmError> {
        let start = config.managed_start();
        let end = config.phys_end();
        let frames = (end - start) / PAGE_SIZE;
        let table_frames = div_round_up(frames * size_of::<Page>(), PAGE_SIZE);
        if table_frames >= frames {
            return Err(MmError::NoUsableMemory);
        }

        let table = map.as_mut_ptr::<Page>(start);
        for i in 0..frames {
            table.add(i).write(Page::reserved());
        }
        let mem_map = core::slice::from_raw_parts_mut(table, frames);

        let mut first_free = start + table_frames * PAGE_SIZE;
        if (first_free / PAGE_SIZE) % 2 == 1 {
            first_free += PAGE_SIZE;
        }

        let mut buddy = BuddyAllocator::new();
        buddy.init(mem_map, start);
        let added = buddy.add_range(first_free, end);
        if added == 0 {
            return Err(MmError::NoUsableMemory);
        }

        log::info!(
            "[BUDDY] {} frames at {:#x}..{:#x}, descriptor table {} frames, {} free",
            frames,
            start,
            end,
            table_frames,
            added
        );

        Ok(Self::new(buddy, config.policy))
    }

    /// Allocate `2^order` contiguous frames.
    pub fn alloc(&self, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            log::warn!("[BUDDY] order {order} above maximum {MAX_ORDER}");
            return None;
        }
        let pa = self.buddy.lock().alloc(order);
        match pa {
            Some(pa) => log::trace!("[BUDDY] alloc order {order} -> {pa:#x}"),
            None => log::error!("[BUDDY] out of memory for order {order}"),
        }
        pa
    }

    /// Release a block. Malformed requests are reported and ignored.
    pub fn free(&self, pa: usize, order: usize) -> Result<(), FrameError> {
        let result = self.buddy.lock().free(pa, order);
        match result {
            Ok(()) => log::trace!("[BUDDY] free {pa:#x} order {order}"),
            Err(err) => self.policy.handle("BUDDY", &err),
        }
        result
    }

    pub fn alloc_one(&self) -> Option<usize> {
        self.alloc(0)
    }

    pub fn free_one(&self, pa: usize) -> Result<(), FrameError> {
        self.free(pa, 0)
    }

    /// Add an owner to a used block; it is released once every owner freed it.
    pub fn share(&self, pa: usize) -> Result<u16, FrameError> {
        self.buddy.lock().share(pa)
    }

    pub fn stats(&self) -> FrameStats {
        let buddy = self.buddy.lock();
        FrameStats {
            total: buddy.total_frames(),
            free: buddy.free_frames(),
        }
    }

    pub fn free_blocks(&self, order: usize) -> usize {
        self.buddy.lock().free_blocks(order)
    }

    pub fn policy(&self) -> CorruptionPolicy {
        self.policy
    }

    pub fn dump(&self) {
        self.buddy.lock().dump();
    }
}

impl PageAllocator for FrameAllocator {
    fn alloc_pages(&self, order: usize) -> Option<usize> {
        self.alloc(order)
    }

    fn free_pages(&self, pa: usize, order: usize) {
        // Already reported through the policy.
        let _ = self.free(pa, order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FAKE_PHYS_BASE, HostMemory, small_config};

    #[test]
    fn test_from_config_reserves_descriptor_table() {
        let config = small_config();
        let host = HostMemory::new(config.phys_size);
        let frames = unsafe { FrameAllocator::from_config(&config, host.map) }.unwrap();

        let managed = (config.phys_size - config.kernel_reserved) / PAGE_SIZE;
        let table_frames = div_round_up(managed * size_of::<Page>(), PAGE_SIZE);
        let stats = frames.stats();
        assert_eq!(stats.total, managed);
        assert!(stats.free <= managed - table_frames);
        assert!(stats.free >= managed - table_frames - 1);

        // Nothing below the end of the descriptor table is ever handed out.
        let table_end = config.managed_start() + table_frames * PAGE_SIZE;
        for _ in 0..64 {
            let pa = frames.alloc_one().unwrap();
            assert!(pa >= table_end);
            assert!(pa < FAKE_PHYS_BASE + config.phys_size);
        }
    }

    #[test]
    fn test_first_free_frame_is_order1_aligned() {
        let config = small_config();
        let host = HostMemory::new(config.phys_size);
        let frames = unsafe { FrameAllocator::from_config(&config, host.map) }.unwrap();

        let mut lowest = usize::MAX;
        while let Some(pa) = frames.alloc(1) {
            assert_eq!(pa % (2 * PAGE_SIZE), 0);
            lowest = lowest.min(pa);
        }
        assert_eq!((lowest / PAGE_SIZE) % 2, 0);
    }

    #[test]
    fn test_rejected_free_is_ignored_under_report_policy() {
        let (_host, frames) = crate::testing::frames(64);
        let pa = frames.alloc(2).unwrap();
        let before = frames.stats();

        assert_eq!(frames.free(pa, 1), Err(FrameError::OrderMismatch));
        assert_eq!(frames.free(0, 0), Err(FrameError::InvalidAddress));
        assert_eq!(frames.stats(), before);

        frames.free(pa, 2).unwrap();
        assert_eq!(frames.stats().free, 64);
    }

    #[test]
    #[should_panic(expected = "corrupted free")]
    fn test_panic_policy_on_double_free() {
        let (_host, frames) = crate::testing::frames_with_policy(8, CorruptionPolicy::Panic);
        let pa = frames.alloc_one().unwrap();
        frames.free_one(pa).unwrap();
        let _ = frames.free_one(pa);
    }

    #[test]
    fn test_page_allocator_trait_and_share() {
        let (_host, frames) = crate::testing::frames(8);
        let alloc: &dyn PageAllocator = &frames;

        let pa = alloc.alloc_page().unwrap();
        assert_eq!(frames.share(pa), Ok(2));
        alloc.free_page(pa);
        assert_eq!(frames.stats().free, 7);
        alloc.free_page(pa);
        assert_eq!(frames.stats().free, 8);
        assert_eq!(frames.free_blocks(3), 1);
    }
}
