//! The memory subsystem context and its boot sequence.
//!
//! [`MemorySubsystem`] owns the frame allocator, the slab allocator, the
//! kernel page table and the region window, each behind its own
//! [`IrqSafeLock`]. Locks are always taken in the order
//! regions, page table, slab, frames.

use crate::IrqSafeLock;
use crate::allocator::slab::MIN_ALIGN;
use crate::allocator::{
    CacheHandle, CacheStats, FrameError, PAGE_SIZE, SlabAllocator, SlabError, SlabReport,
};
use crate::config::{CorruptionPolicy, MmConfig};
use crate::memory::FrameAllocator;
use crate::mmu::{KernelPageTable, MappingStats, MmuError, PageSize, PteFlags, Translation};
use crate::phys::DirectMap;
use crate::vmalloc::{VmError, VmRegion, VmallocArea};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use rvk_error::define_kernel_error;
use rvk_utils::Once;

define_kernel_error! {
    /// Memory subsystem errors (0x05xx)
    pub enum MmError(0x05) {
        Frames(FrameError) = 0x01 => "Frame allocator failed",
        Slab(SlabError) = 0x02 => "Slab allocator failed",
        Mmu(MmuError) = 0x03 => "Page table setup failed",
        Vm(VmError) = 0x04 => "Region window setup failed",
        /// See [`MmConfig::validate`]
        InvalidConfig = 0x05 => "Inconsistent memory configuration",
        AlreadyInitialized = 0x06 => "Memory subsystem already initialized",
        /// Nothing left after the kernel image and the descriptor table
        NoUsableMemory = 0x07 => "No usable memory",
    }
}

pub struct MemorySubsystem {
    config: MmConfig,
    map: DirectMap,
    frames: FrameAllocator,
    slab: IrqSafeLock<SlabAllocator>,
    page_table: IrqSafeLock<KernelPageTable>,
    vmalloc: IrqSafeLock<VmallocArea>,
}

impl MemorySubsystem {
    /// Bring up frames, slab, page table and region window, in that order.
    ///
    /// # Safety
    /// RAM described by `config` past the kernel image must be unused and
    /// reachable through `map`. With `enable_translation` set, the identity
    /// map must cover everything the caller runs from.
    pub unsafe fn init(config: MmConfig, map: DirectMap) -> Result<Self, MmError> {
        config.validate()?;
        log::info!(
            "[MM] RAM {:#x}..{:#x}, kernel image {:#x} bytes",
            config.phys_base,
            config.phys_end(),
            config.kernel_reserved
        );

        let frames = FrameAllocator::from_config(&config, map)?;

        let mut slab = SlabAllocator::new(map, config.max_caches);
        slab.init()?;

        let mut page_table = KernelPageTable::new(&frames, map)?;
        if config.identity_map {
            let stats = page_table.map_region_large(
                config.phys_base,
                config.phys_base,
                config.phys_size,
                PteFlags::KERNEL_RWX,
                &frames,
            )?;
            log::info!(
                "[MM] identity map: {} x 1G, {} x 2M, {} x 4K",
                stats.gigapages,
                stats.megapages,
                stats.pages
            );
        }
        if config.enable_translation {
            page_table.activate();
        }

        let vmalloc = VmallocArea::new(
            config.vmalloc_start,
            config.vmalloc_size,
            config.max_regions,
            &frames,
            map,
        )?;

        let stats = frames.stats();
        log::info!("[MM] ready: {} of {} frames free", stats.free, stats.total);

        Ok(Self {
            config,
            map,
            frames,
            slab: IrqSafeLock::new(slab),
            page_table: IrqSafeLock::new(page_table),
            vmalloc: IrqSafeLock::new(vmalloc),
        })
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    pub fn direct_map(&self) -> DirectMap {
        self.map
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    fn policy(&self) -> CorruptionPolicy {
        self.config.policy
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub fn kalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.slab.lock().kalloc(size, &self.frames)
    }

    /// Like [`kalloc`](Self::kalloc) with an alignment requirement.
    ///
    /// Slab objects are word aligned; stricter alignment up to a page is
    /// served by a whole frame, so `size` must fit in one.
    pub fn kalloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() || size == 0 {
            return None;
        }
        if align <= MIN_ALIGN {
            return self.kalloc(size);
        }
        if align > PAGE_SIZE || size > PAGE_SIZE {
            log::warn!("[SLAB] no allocation of {size} bytes aligned to {align}");
            return None;
        }
        let pa = self.frames.alloc_one()?;
        NonNull::new(self.map.phys_to_virt(pa) as *mut u8)
    }

    /// Release memory from `kalloc`. Null is ignored.
    pub fn kfree(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let result = self.slab.lock().kfree(ptr, &self.frames);
        if let Err(err) = result {
            self.policy().handle("SLAB", &err);
        }
    }

    pub fn cache_create(&self, name: &'static str, size: usize) -> Result<CacheHandle, SlabError> {
        self.slab.lock().cache_create(name, size)
    }

    pub fn cache_destroy(&self, handle: CacheHandle) -> Result<(), SlabError> {
        self.slab.lock().cache_destroy(handle, &self.frames)
    }

    pub fn cache_alloc(&self, handle: CacheHandle) -> Result<NonNull<u8>, SlabError> {
        self.slab.lock().cache_alloc(handle, &self.frames)
    }

    /// Return an object to its cache. Corrupt requests go through the
    /// configured [`CorruptionPolicy`].
    pub fn cache_free(&self, handle: CacheHandle, ptr: NonNull<u8>) -> Result<(), SlabError> {
        let result = self.slab.lock().cache_free(handle, ptr, &self.frames);
        if let Err(err) = result
            && is_slab_corruption(err)
        {
            self.policy().handle("SLAB", &err);
        }
        result
    }

    pub fn cache_stats(&self, handle: CacheHandle) -> Result<CacheStats, SlabError> {
        Ok(self.slab.lock().cache(handle)?.stats())
    }

    pub fn slab_verify(&self) -> SlabReport {
        self.slab.lock().verify()
    }

    // ------------------------------------------------------------------
    // Kernel page table
    // ------------------------------------------------------------------

    pub fn satp(&self) -> usize {
        self.page_table.lock().satp()
    }

    pub fn map_leaf(
        &self,
        va: usize,
        pa: usize,
        flags: PteFlags,
        size: PageSize,
    ) -> Result<(), MmuError> {
        self.page_table
            .lock()
            .map_leaf(va, pa, flags, size, &self.frames)
    }

    pub fn map_region(
        &self,
        va: usize,
        pa: usize,
        size: usize,
        flags: PteFlags,
    ) -> Result<MappingStats, MmuError> {
        self.page_table
            .lock()
            .map_region(va, pa, size, flags, &self.frames)
    }

    pub fn map_region_large(
        &self,
        va: usize,
        pa: usize,
        size: usize,
        flags: PteFlags,
    ) -> Result<MappingStats, MmuError> {
        self.page_table
            .lock()
            .map_region_large(va, pa, size, flags, &self.frames)
    }

    pub fn unmap(&self, va: usize) -> Result<usize, MmuError> {
        self.page_table.lock().unmap(va, &self.frames)
    }

    pub fn lookup(&self, va: usize) -> Option<Translation> {
        self.page_table.lock().lookup(va)
    }

    pub fn protect(&self, va: usize, flags: PteFlags) -> Result<(), MmuError> {
        self.page_table.lock().protect(va, flags)
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    pub fn vmalloc(&self, size: usize) -> Result<usize, VmError> {
        let mut vm = self.vmalloc.lock();
        let mut pt = self.page_table.lock();
        vm.vmalloc(size, &mut pt, &self.frames)
    }

    pub fn vzalloc(&self, size: usize) -> Result<usize, VmError> {
        let mut vm = self.vmalloc.lock();
        let mut pt = self.page_table.lock();
        vm.vzalloc(size, &mut pt, &self.frames)
    }

    pub fn vfree(&self, addr: usize) -> Result<(), VmError> {
        let result = {
            let mut vm = self.vmalloc.lock();
            let mut pt = self.page_table.lock();
            vm.vfree(addr, &mut pt, &self.frames)
        };
        self.check_release(result)
    }

    pub fn vmap(&self, pages: &[usize], flags: PteFlags) -> Result<usize, VmError> {
        let mut vm = self.vmalloc.lock();
        let mut pt = self.page_table.lock();
        vm.vmap(pages, flags, &mut pt, &self.frames)
    }

    pub fn vunmap(&self, addr: usize) -> Result<(), VmError> {
        let result = {
            let mut vm = self.vmalloc.lock();
            let mut pt = self.page_table.lock();
            vm.vunmap(addr, &mut pt, &self.frames)
        };
        self.check_release(result)
    }

    pub fn ioremap(&self, phys: usize, size: usize) -> Result<usize, VmError> {
        let mut vm = self.vmalloc.lock();
        let mut pt = self.page_table.lock();
        vm.ioremap(phys, size, &mut pt, &self.frames)
    }

    pub fn iounmap(&self, addr: usize) -> Result<(), VmError> {
        let result = {
            let mut vm = self.vmalloc.lock();
            let mut pt = self.page_table.lock();
            vm.iounmap(addr, &mut pt, &self.frames)
        };
        self.check_release(result)
    }

    pub fn find_region(&self, addr: usize) -> Option<VmRegion> {
        self.vmalloc.lock().find_region(addr)
    }

    /// Log frame, slab and region statistics.
    pub fn dump_stats(&self) {
        let stats = self.frames.stats();
        log::info!("[MM] frames: {} total, {} free", stats.total, stats.free);
        self.frames.dump();
        self.slab.lock().dump();
        self.vmalloc.lock().dump();
    }

    /// Region releases naming the wrong kind are corruption; unknown
    /// addresses are only warned about.
    fn check_release(&self, result: Result<(), VmError>) -> Result<(), VmError> {
        match result {
            Err(err @ VmError::WrongKind) => self.policy().handle("VMALLOC", &err),
            Err(err @ VmError::NotFound) => log::warn!("[VMALLOC] release: {err}"),
            _ => {}
        }
        result
    }
}

fn is_slab_corruption(err: SlabError) -> bool {
    matches!(
        err,
        SlabError::NotSlab
            | SlabError::ForeignCache
            | SlabError::BadPointer
            | SlabError::DoubleFree
            | SlabError::Corrupted
    )
}

// ============================================================================
// Global instance
// ============================================================================

static MM: Once<MemorySubsystem> = Once::new();

/// Initialize the global memory subsystem.
///
/// Concurrent callers wait for the first one; only a failed attempt lets a
/// later call try again.
///
/// # Safety
/// Same contract as [`MemorySubsystem::init`].
pub unsafe fn init(config: MmConfig, map: DirectMap) -> Result<&'static MemorySubsystem, MmError> {
    let mut ran = false;
    let mm = MM.try_call_once(|| {
        ran = true;
        // SAFETY: forwarded from the caller
        unsafe { MemorySubsystem::init(config, map) }
    })?;
    if ran {
        Ok(mm)
    } else {
        Err(MmError::AlreadyInitialized)
    }
}

/// The global memory subsystem, once [`init`] succeeded.
pub fn get() -> Option<&'static MemorySubsystem> {
    MM.get()
}

/// `kalloc` on the global subsystem.
pub fn kalloc(size: usize) -> Option<NonNull<u8>> {
    get()?.kalloc(size)
}

/// `kfree` on the global subsystem.
pub fn kfree(ptr: *mut u8) {
    match get() {
        Some(mm) => mm.kfree(ptr),
        None => log::warn!("[MM] kfree({ptr:p}) before init"),
    }
}

/// `GlobalAlloc` over the global subsystem's `kalloc`/`kfree`.
///
/// Allocations fail (return null) until [`init`] has run.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        get()
            .and_then(|mm| mm.kalloc_aligned(layout.size(), layout.align()))
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        kfree(ptr);
    }
}
