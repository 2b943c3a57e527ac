//! Virtual regions: vmalloc, vmap and ioremap.
//!
//! A fixed window of kernel virtual space is handed out in page-granular
//! regions. Each region is followed by one unmapped guard page so a linear
//! overrun faults instead of running into the next region.
//!
//! Region descriptors live in a pool carved out of frames at init, linked
//! into a free list and an address-ordered active list. A vmalloc region
//! records its backing frames in a frame-backed array so `vfree` can return
//! them.

use crate::allocator::{MAX_ORDER, PAGE_SIZE, order_for_pages};
use crate::mmu::{KernelPageTable, MmuError, PageSize, PteFlags};
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use rvk_error::define_kernel_error;
use rvk_utils::{IndexList, Link, Linked, align_down, div_round_up, is_aligned};

define_kernel_error! {
    /// Virtual region errors (0x04xx)
    pub enum VmError(0x04) {
        InvalidSize = 0x01 => "Region size is zero",
        /// Every region descriptor is in use
        NoDescriptor = 0x02 => "Region descriptor pool exhausted",
        NoVirtualSpace = 0x03 => "No gap large enough in the region window",
        OutOfMemory = 0x04 => "Frame allocation failed",
        /// No region starts at the given address
        NotFound = 0x05 => "No region at this address",
        /// Release through the wrong API (e.g. `vfree` on an ioremap)
        WrongKind = 0x06 => "Region has a different kind",
        /// A page handed to vmap is not frame-aligned
        Misaligned = 0x07 => "Page address not aligned",
        /// Frame list or descriptor pool above MAX_ORDER
        TooLarge = 0x08 => "Request too large",
        Mmu(MmuError) = 0x09 => "Page table operation failed",
    }
}

/// How a region got its frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Frames allocated and owned by the region (`vmalloc`).
    Alloc,
    /// Caller-owned frames (`vmap`).
    Map,
    /// Device memory (`ioremap`).
    IoRemap,
}

/// Frame-backed array of physical addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameList {
    pa: usize,
    order: usize,
}

/// One region descriptor.
#[derive(Clone, Copy, Debug)]
pub struct VmRegion {
    start: usize,
    size: usize,
    kind: RegionKind,
    nr_pages: usize,
    phys: usize,
    frames: Option<FrameList>,
    link: Link,
}

impl VmRegion {
    const UNUSED: Self = Self {
        start: 0,
        size: 0,
        kind: RegionKind::Alloc,
        nr_pages: 0,
        phys: 0,
        frames: None,
        link: Link::UNLINKED,
    };

    /// First virtual address.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Bytes reserved, guard page included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Mapped pages, guard page excluded.
    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// Physical base for `Map` and `IoRemap` regions, 0 for `Alloc`.
    pub fn phys(&self) -> usize {
        self.phys
    }

    /// Address of the unmapped page that ends the region.
    pub fn guard_page(&self) -> usize {
        self.start + self.nr_pages * PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}

impl Linked for VmRegion {
    fn link(&self) -> Link {
        self.link
    }

    fn set_link(&mut self, link: Link) {
        self.link = link;
    }
}

/// Allocator for the region window.
pub struct VmallocArea {
    start: usize,
    end: usize,
    pool: &'static mut [VmRegion],
    pool_pa: usize,
    pool_order: usize,
    /// Active regions sorted by start address.
    active: IndexList,
    unused: IndexList,
    map: DirectMap,
}

impl VmallocArea {
    /// Set up the window `start..start + size` with room for `capacity`
    /// regions. The descriptor pool is taken from `frames`.
    pub fn new(
        start: usize,
        size: usize,
        capacity: usize,
        frames: &dyn PageAllocator,
        map: DirectMap,
    ) -> Result<Self, VmError> {
        if size == 0 || capacity == 0 {
            return Err(VmError::InvalidSize);
        }
        if !is_aligned(start, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
            return Err(VmError::Mmu(MmuError::Misaligned));
        }
        let bytes = capacity
            .checked_mul(size_of::<VmRegion>())
            .ok_or(VmError::TooLarge)?;
        let pool_order = order_for_pages(div_round_up(bytes, PAGE_SIZE));
        if pool_order > MAX_ORDER || capacity >= rvk_utils::NIL as usize {
            return Err(VmError::TooLarge);
        }
        let pool_pa = frames
            .alloc_pages(pool_order)
            .ok_or(VmError::OutOfMemory)?;

        // SAFETY: the block was just allocated and holds `capacity` descriptors
        let pool = unsafe {
            let base = map.as_mut_ptr::<VmRegion>(pool_pa);
            for i in 0..capacity {
                base.add(i).write(VmRegion::UNUSED);
            }
            core::slice::from_raw_parts_mut(base, capacity)
        };

        let mut unused = IndexList::new();
        for slot in (0..capacity as u32).rev() {
            unused.push_front(&mut *pool, slot);
        }

        log::info!(
            "[VMALLOC] window {:#x}..{:#x}, {} descriptors",
            start,
            start + size,
            capacity
        );

        Ok(Self {
            start,
            end: start + size,
            pool,
            pool_pa,
            pool_order,
            active: IndexList::new(),
            unused,
            map,
        })
    }

    pub fn window(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    /// Free descriptors left in the pool.
    pub fn free_descriptors(&self) -> usize {
        self.unused.len()
    }

    /// Physical block holding the descriptor pool, as `(pa, order)`.
    pub fn pool_block(&self) -> (usize, usize) {
        (self.pool_pa, self.pool_order)
    }

    /// First address where `pages` pages plus a guard page fit, and the
    /// region it must be linked after.
    pub fn find_gap(&self, pages: usize) -> Option<(usize, Option<u32>)> {
        let needed = pages.checked_add(1)?.checked_mul(PAGE_SIZE)?;
        let mut cursor = self.start;
        let mut prev = None;
        for index in self.active.iter(&*self.pool) {
            let region = &self.pool[index as usize];
            if region.start - cursor >= needed {
                return Some((cursor, prev));
            }
            cursor = region.start + region.size;
            prev = Some(index);
        }
        (self.end - cursor >= needed).then_some((cursor, prev))
    }

    /// Allocate, zero and map `size` bytes of frames.
    pub fn vmalloc(
        &mut self,
        size: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<usize, VmError> {
        if size == 0 {
            return Err(VmError::InvalidSize);
        }
        let pages = div_round_up(size, PAGE_SIZE);
        let list_order = pages
            .checked_mul(size_of::<usize>())
            .map_or(usize::MAX, |bytes| order_for_pages(div_round_up(bytes, PAGE_SIZE)));
        if list_order > MAX_ORDER {
            return Err(VmError::TooLarge);
        }

        let slot = self.reserve(pages, RegionKind::Alloc, 0)?;
        let Some(list_pa) = frames.alloc_pages(list_order) else {
            self.release(slot);
            log::error!("[VMALLOC] no frames for the page list of {pages} pages");
            return Err(VmError::OutOfMemory);
        };
        let list = FrameList {
            pa: list_pa,
            order: list_order,
        };
        self.pool[slot as usize].frames = Some(list);
        let start = self.pool[slot as usize].start;

        for i in 0..pages {
            if let Err(err) = self.back_page(start + i * PAGE_SIZE, list, i, pt, frames) {
                log::error!("[VMALLOC] vmalloc({size}) failed at page {i}: {err}");
                self.teardown(slot, i, pt, frames);
                return Err(err);
            }
        }

        log::debug!("[VMALLOC] vmalloc {size} bytes -> {start:#x} ({pages} pages)");
        Ok(start)
    }

    /// Same as [`vmalloc`](Self::vmalloc); region memory is always zeroed.
    pub fn vzalloc(
        &mut self,
        size: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<usize, VmError> {
        self.vmalloc(size, pt, frames)
    }

    /// Unmap a vmalloc region and release its frames.
    pub fn vfree(
        &mut self,
        addr: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<(), VmError> {
        let slot = self.lookup_start(addr, RegionKind::Alloc)?;
        let pages = self.pool[slot as usize].nr_pages;
        self.teardown(slot, pages, pt, frames);
        log::debug!("[VMALLOC] vfree {addr:#x} ({pages} pages)");
        Ok(())
    }

    /// Map caller-owned frames contiguously. The frames stay owned by the
    /// caller.
    pub fn vmap(
        &mut self,
        pages: &[usize],
        flags: PteFlags,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<usize, VmError> {
        let first = *pages.first().ok_or(VmError::InvalidSize)?;
        if pages.iter().any(|&pa| !is_aligned(pa, PAGE_SIZE)) {
            return Err(VmError::Misaligned);
        }
        if !flags.is_valid_leaf() {
            return Err(VmError::Mmu(MmuError::InvalidFlags));
        }

        let slot = self.reserve(pages.len(), RegionKind::Map, first)?;
        let start = self.pool[slot as usize].start;
        for (i, &pa) in pages.iter().enumerate() {
            if let Err(err) = pt.map_leaf(start + i * PAGE_SIZE, pa, flags, PageSize::Size4K, frames)
            {
                log::error!("[VMALLOC] vmap failed at page {i}: {err}");
                self.teardown(slot, i, pt, frames);
                return Err(err.into());
            }
        }

        log::debug!("[VMALLOC] vmap {} pages -> {start:#x}", pages.len());
        Ok(start)
    }

    /// Undo a [`vmap`](Self::vmap). The frames are not freed.
    pub fn vunmap(
        &mut self,
        addr: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<(), VmError> {
        let slot = self.lookup_start(addr, RegionKind::Map)?;
        let pages = self.pool[slot as usize].nr_pages;
        self.teardown(slot, pages, pt, frames);
        Ok(())
    }

    /// Map `size` bytes of device memory at `phys`.
    ///
    /// `phys` need not be aligned; the returned address carries the same
    /// offset within its page.
    pub fn ioremap(
        &mut self,
        phys: usize,
        size: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<usize, VmError> {
        if size == 0 {
            return Err(VmError::InvalidSize);
        }
        let offset = phys & (PAGE_SIZE - 1);
        let base = align_down(phys, PAGE_SIZE);
        let pages = offset
            .checked_add(size)
            .map(|bytes| div_round_up(bytes, PAGE_SIZE))
            .ok_or(VmError::TooLarge)?;

        let slot = self.reserve(pages, RegionKind::IoRemap, base)?;
        let start = self.pool[slot as usize].start;
        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let pa = base + i * PAGE_SIZE;
            if let Err(err) = pt.map_leaf(va, pa, PteFlags::KERNEL_RW, PageSize::Size4K, frames) {
                log::error!("[VMALLOC] ioremap({phys:#x}) failed at page {i}: {err}");
                self.teardown(slot, i, pt, frames);
                return Err(err.into());
            }
        }

        log::debug!("[VMALLOC] ioremap {phys:#x}+{size:#x} -> {:#x}", start + offset);
        Ok(start + offset)
    }

    /// Undo an [`ioremap`](Self::ioremap). Any address inside the first page
    /// is accepted.
    pub fn iounmap(
        &mut self,
        addr: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<(), VmError> {
        let slot = self.lookup_start(align_down(addr, PAGE_SIZE), RegionKind::IoRemap)?;
        let pages = self.pool[slot as usize].nr_pages;
        self.teardown(slot, pages, pt, frames);
        Ok(())
    }

    /// Region whose reserved range (guard page included) covers `addr`.
    pub fn find_region(&self, addr: usize) -> Option<VmRegion> {
        self.regions().find(|r| r.contains(addr))
    }

    /// Active regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = VmRegion> + '_ {
        self.active
            .iter(&*self.pool)
            .map(|index| self.pool[index as usize])
    }

    pub fn dump(&self) {
        log::info!(
            "[VMALLOC] {} regions, {} free descriptors",
            self.active.len(),
            self.unused.len()
        );
        for r in self.regions() {
            log::info!(
                "[VMALLOC]   {:#x}..{:#x} {:?} {} pages phys {:#x}",
                r.start,
                r.start + r.size,
                r.kind,
                r.nr_pages,
                r.phys
            );
        }
    }

    /// Take a descriptor and link it into the first gap for `pages`.
    fn reserve(&mut self, pages: usize, kind: RegionKind, phys: usize) -> Result<u32, VmError> {
        if self.unused.is_empty() {
            log::error!("[VMALLOC] descriptor pool exhausted");
            return Err(VmError::NoDescriptor);
        }
        let Some((start, prev)) = self.find_gap(pages) else {
            log::error!("[VMALLOC] no room for {pages} pages");
            return Err(VmError::NoVirtualSpace);
        };
        let slot = self
            .unused
            .pop_front(&mut *self.pool)
            .ok_or(VmError::NoDescriptor)?;

        self.pool[slot as usize] = VmRegion {
            start,
            size: (pages + 1) * PAGE_SIZE,
            kind,
            nr_pages: pages,
            phys,
            frames: None,
            link: Link::UNLINKED,
        };
        self.active.insert_after(&mut *self.pool, prev, slot);
        Ok(slot)
    }

    /// Unlink a descriptor and return it to the pool.
    fn release(&mut self, slot: u32) {
        self.active.remove(&mut *self.pool, slot);
        self.pool[slot as usize] = VmRegion::UNUSED;
        self.unused.push_front(&mut *self.pool, slot);
    }

    fn lookup_start(&self, addr: usize, kind: RegionKind) -> Result<u32, VmError> {
        let slot = self
            .active
            .iter(&*self.pool)
            .find(|&i| self.pool[i as usize].start == addr)
            .ok_or(VmError::NotFound)?;
        let found = self.pool[slot as usize].kind;
        if found != kind {
            log::warn!("[VMALLOC] {addr:#x} is a {found:?} region, not {kind:?}");
            return Err(VmError::WrongKind);
        }
        Ok(slot)
    }

    /// Allocate, zero and map one frame of a vmalloc region.
    fn back_page(
        &self,
        va: usize,
        list: FrameList,
        index: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) -> Result<(), VmError> {
        let pa = frames.alloc_page().ok_or(VmError::OutOfMemory)?;
        // SAFETY: freshly allocated frame
        unsafe { self.map.zero_frames(pa, 1) };
        if let Err(err) = pt.map_leaf(va, pa, PteFlags::KERNEL_RW, PageSize::Size4K, frames) {
            frames.free_page(pa);
            return Err(err.into());
        }
        // SAFETY: index < nr_pages, which the list was sized for
        unsafe { self.map.as_mut_ptr::<usize>(list.pa).add(index).write(pa) };
        Ok(())
    }

    /// Unmap the first `mapped` pages of a region, free owned frames and
    /// release the descriptor.
    fn teardown(
        &mut self,
        slot: u32,
        mapped: usize,
        pt: &mut KernelPageTable,
        frames: &dyn PageAllocator,
    ) {
        let region = self.pool[slot as usize];
        for i in 0..mapped {
            let va = region.start + i * PAGE_SIZE;
            if let Err(err) = pt.unmap(va, frames) {
                log::warn!("[VMALLOC] unmap {va:#x}: {err}");
            }
        }
        if let Some(list) = region.frames {
            let table = self.map.as_mut_ptr::<usize>(list.pa);
            for i in 0..mapped {
                // SAFETY: entries below `mapped` were written by back_page
                frames.free_page(unsafe { table.add(i).read() });
            }
            frames.free_pages(list.pa, list.order);
        }
        self.release(slot);
    }
}
