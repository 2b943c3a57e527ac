//! RISC-V SV39 page tables.
//!
//! Three levels of 512-entry tables translate 39-bit virtual addresses. A
//! leaf may sit at any level: level 2 maps a 1 GiB gigapage, level 1 a 2 MiB
//! megapage, level 0 a 4 KiB page. Tables live in frames from the frame
//! allocator and are reached through the [`DirectMap`].

use crate::allocator::{PAGE_SHIFT, PAGE_SIZE};
use crate::phys::DirectMap;
use crate::traits::PageAllocator;
use bitflags::bitflags;
use rvk_error::define_kernel_error;
use rvk_utils::{align_down, div_round_up, is_aligned};

define_kernel_error! {
    /// Page table errors (0x01xx)
    pub enum MmuError(0x01) {
        /// Page table allocation failed
        AllocationFailed = 0x01 => "Page table allocation failed",
        /// Address not mapped
        NotMapped = 0x02 => "Address not mapped",
        /// Bits 63..39 do not all equal bit 38
        InvalidVirtualAddress = 0x03 => "Non-canonical virtual address",
        /// Address not properly aligned
        Misaligned = 0x04 => "Address not properly aligned",
        /// No R/W/X bit, or W without R
        InvalidFlags = 0x05 => "Invalid leaf permissions",
        /// A larger leaf already covers the address
        AlreadyMapped = 0x06 => "Covered by a larger mapping",
        /// A next-level table sits where a huge leaf was requested
        Occupied = 0x07 => "Entry holds a page table",
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Entries per page table (512 for 4KB pages with 8-byte entries)
pub const ENTRIES_PER_TABLE: usize = 512;
/// Level of the root table.
pub const ROOT_LEVEL: usize = 2;
pub const MEGAPAGE_SIZE: usize = 2 * 1024 * 1024;
pub const GIGAPAGE_SIZE: usize = 1024 * 1024 * 1024;
/// `satp.MODE` for SV39.
pub const SATP_MODE_SV39: usize = 8 << 60;
/// Bits of the virtual address that are translated.
pub const VA_BITS: u32 = 39;

/// PPN field of an entry starts at bit 10.
const PTE_PPN_SHIFT: u32 = 10;
/// 44-bit physical page number.
const PTE_PPN_MASK: u64 = (1 << 44) - 1;

// ============================================================================
// Page Flags
// ============================================================================

bitflags! {
    /// SV39 page table entry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXECUTE  = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    /// Permission bits; an entry with any of them set is a leaf.
    pub const RWX: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXECUTE);

    pub const KERNEL_RW: PteFlags = PteFlags::VALID
        .union(PteFlags::READ)
        .union(PteFlags::WRITE)
        .union(PteFlags::ACCESSED)
        .union(PteFlags::DIRTY);
    pub const KERNEL_RO: PteFlags = PteFlags::VALID
        .union(PteFlags::READ)
        .union(PteFlags::ACCESSED);
    pub const KERNEL_RX: PteFlags = PteFlags::VALID
        .union(PteFlags::READ)
        .union(PteFlags::EXECUTE)
        .union(PteFlags::ACCESSED);
    pub const KERNEL_RWX: PteFlags = PteFlags::KERNEL_RW.union(PteFlags::EXECUTE);

    pub const USER_RW: PteFlags = PteFlags::KERNEL_RW.union(PteFlags::USER);
    pub const USER_RO: PteFlags = PteFlags::KERNEL_RO.union(PteFlags::USER);
    pub const USER_RX: PteFlags = PteFlags::KERNEL_RX.union(PteFlags::USER);
    pub const USER_RWX: PteFlags = PteFlags::KERNEL_RWX.union(PteFlags::USER);

    /// Whether these flags may be written into a leaf.
    pub fn is_valid_leaf(self) -> bool {
        self.intersects(Self::RWX) && !(self.contains(Self::WRITE) && !self.contains(Self::READ))
    }
}

// ============================================================================
// Page Table Entry
// ============================================================================

/// A 64-bit SV39 page table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create an empty (invalid) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.0 & PteFlags::VALID.bits()) != 0
    }

    /// Valid with at least one of R/W/X.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && (self.0 & PteFlags::RWX.bits()) != 0
    }

    /// Valid pointer to a next-level table.
    #[inline]
    pub fn is_table(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Physical address held in the PPN field.
    #[inline]
    pub fn address(&self) -> usize {
        (((self.0 >> PTE_PPN_SHIFT) & PTE_PPN_MASK) << PAGE_SHIFT) as usize
    }

    #[inline]
    pub fn set(&mut self, addr: usize, flags: PteFlags) {
        self.0 = (((addr >> PAGE_SHIFT) as u64 & PTE_PPN_MASK) << PTE_PPN_SHIFT) | flags.bits();
    }

    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Replace the flags, keeping the PPN.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !0x3FF) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

/// A 4KB-aligned page table with 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Zero all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Check if all entries in the table are invalid.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_valid())
    }
}

/// Leaf granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4K => PAGE_SIZE,
            Self::Size2M => MEGAPAGE_SIZE,
            Self::Size1G => GIGAPAGE_SIZE,
        }
    }

    /// Table level holding a leaf of this size.
    pub const fn level(self) -> usize {
        match self {
            Self::Size4K => 0,
            Self::Size2M => 1,
            Self::Size1G => 2,
        }
    }

    const fn at_level(level: usize) -> Self {
        match level {
            0 => Self::Size4K,
            1 => Self::Size2M,
            _ => Self::Size1G,
        }
    }
}

// ============================================================================
// Virtual Address Indexing
// ============================================================================

/// Index into the table at `level` (VPN[level]).
#[inline]
pub fn vpn(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & 0x1FF
}

/// Bits 63..39 must all equal bit 38.
#[inline]
pub fn is_canonical(va: usize) -> bool {
    let upper = (va as i64) >> (VA_BITS - 1);
    upper == 0 || upper == -1
}

// ============================================================================
// TLB
// ============================================================================

pub mod tlb {
    //! Translation cache maintenance (`sfence.vma`).

    use crate::allocator::PAGE_SIZE;

    /// Ranges longer than this many pages flush everything instead.
    pub const RANGE_FLUSH_LIMIT: usize = 64;

    pub fn flush_page(va: usize) {
        #[cfg(target_arch = "riscv64")]
        crate::riscv64::csr::sfence_vma_page(va);
        #[cfg(not(target_arch = "riscv64"))]
        let _ = va;
    }

    pub fn flush_all() {
        #[cfg(target_arch = "riscv64")]
        crate::riscv64::csr::sfence_vma_all();
    }

    /// Flush every non-global translation tagged with `asid`.
    pub fn flush_asid(asid: u16) {
        #[cfg(target_arch = "riscv64")]
        crate::riscv64::csr::sfence_vma_asid(usize::from(asid));
        #[cfg(not(target_arch = "riscv64"))]
        let _ = asid;
    }

    pub fn flush_range(start: usize, size: usize) {
        let first = rvk_utils::align_down(start, PAGE_SIZE);
        let pages = rvk_utils::div_round_up(start - first + size, PAGE_SIZE);
        if pages > RANGE_FLUSH_LIMIT {
            flush_all();
            return;
        }
        for i in 0..pages {
            flush_page(first + i * PAGE_SIZE);
        }
    }
}

// ============================================================================
// Page Table Mapping
// ============================================================================

/// Result of a page table walk.
pub struct WalkResult<'a> {
    /// The table containing the entry.
    pub table: &'a mut PageTable,
    /// The index of the entry within the table.
    pub index: usize,
    /// Level of `table`. Above the requested level when a larger leaf was hit.
    pub level: usize,
    /// The path of tables and indices taken to reach the entry.
    pub breadcrumbs: Breadcrumbs,
}

/// Path used for table reclamation, indexed by level.
#[derive(Clone, Copy, Debug)]
pub struct Breadcrumbs {
    /// Physical addresses of the tables visited
    pub tables: [Option<usize>; ROOT_LEVEL + 1],
    /// Indices used at each level
    pub indices: [usize; ROOT_LEVEL + 1],
}

/// Translation of one virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address including the offset inside the leaf.
    pub phys: usize,
    pub flags: PteFlags,
    /// Size of the leaf that maps the address.
    pub size: PageSize,
}

/// Statistics from a mapping operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingStats {
    /// Number of 1GB leaves mapped
    pub gigapages: usize,
    /// Number of 2MB leaves mapped
    pub megapages: usize,
    /// Number of 4KB leaves mapped
    pub pages: usize,
}

impl MappingStats {
    /// Total bytes mapped
    pub fn total_bytes(&self) -> usize {
        self.gigapages * GIGAPAGE_SIZE + self.megapages * MEGAPAGE_SIZE + self.pages * PAGE_SIZE
    }

    fn record(&mut self, size: PageSize) {
        match size {
            PageSize::Size4K => self.pages += 1,
            PageSize::Size2M => self.megapages += 1,
            PageSize::Size1G => self.gigapages += 1,
        }
    }
}

/// The kernel's page table.
///
/// The root table is taken from the frame allocator at creation and is never
/// freed. Intermediate tables are created on demand and reclaimed by
/// [`unmap`](Self::unmap) once they hold no valid entry.
pub struct KernelPageTable {
    root: usize,
    map: DirectMap,
}

impl KernelPageTable {
    pub fn new(frames: &dyn PageAllocator, map: DirectMap) -> Result<Self, MmuError> {
        let root = alloc_table(frames, map)?;
        log::debug!("[MMU] root table at {root:#x}");
        Ok(Self { root, map })
    }

    /// Physical address of the root table.
    pub fn root_pa(&self) -> usize {
        self.root
    }

    /// `satp` selecting this table in SV39 mode with ASID 0.
    pub fn satp(&self) -> usize {
        SATP_MODE_SV39 | (self.root >> PAGE_SHIFT)
    }

    /// Switch translation to this table.
    ///
    /// # Safety
    /// The table must map the running code, its stack and everything the
    /// kernel touches through the direct map.
    pub unsafe fn activate(&self) {
        #[cfg(target_arch = "riscv64")]
        crate::riscv64::csr::write_satp(self.satp());
        log::info!("[MMU] translation enabled, satp = {:#x}", self.satp());
    }

    /// Descend towards the entry for `va` at the level of `size`.
    ///
    /// Stops early at an existing leaf of a larger size. Missing tables are
    /// created from `create` when given, otherwise the walk fails with
    /// `NotMapped`. If a table cannot be allocated, the tables this walk
    /// already installed are taken out again.
    pub fn walk(
        &mut self,
        va: usize,
        size: PageSize,
        create: Option<&dyn PageAllocator>,
    ) -> Result<WalkResult<'_>, MmuError> {
        if !is_canonical(va) {
            return Err(MmuError::InvalidVirtualAddress);
        }

        let target = size.level();
        let mut breadcrumbs = Breadcrumbs {
            tables: [None; ROOT_LEVEL + 1],
            indices: [0; ROOT_LEVEL + 1],
        };
        let mut fresh = [None; ROOT_LEVEL + 1];
        let mut level = ROOT_LEVEL;
        let mut table_pa = self.root;

        loop {
            // SAFETY: table_pa is the root or came from a table entry of this tree
            let table = unsafe { table_at(self.map, table_pa) };
            let index = vpn(va, level);
            breadcrumbs.tables[level] = Some(table_pa);
            breadcrumbs.indices[level] = index;

            let entry = *table.entry(index);
            if level == target || entry.is_leaf() {
                return Ok(WalkResult {
                    table,
                    index,
                    level,
                    breadcrumbs,
                });
            }

            table_pa = if entry.is_table() {
                entry.address()
            } else if let Some(frames) = create {
                let child = match alloc_table(frames, self.map) {
                    Ok(child) => child,
                    Err(err) => {
                        release_fresh(self.map, &breadcrumbs, &fresh, frames);
                        return Err(err);
                    }
                };
                table.entry_mut(index).set(child, PteFlags::VALID);
                fresh[level - 1] = Some(child);
                child
            } else {
                return Err(MmuError::NotMapped);
            };
            level -= 1;
        }
    }

    /// Map one leaf of `size` at `va` to `pa`.
    ///
    /// Both addresses are rounded down to the leaf size. An existing leaf of
    /// the same size is overwritten.
    pub fn map_leaf(
        &mut self,
        va: usize,
        pa: usize,
        flags: PteFlags,
        size: PageSize,
        frames: &dyn PageAllocator,
    ) -> Result<(), MmuError> {
        if !flags.is_valid_leaf() {
            return Err(MmuError::InvalidFlags);
        }
        let va = align_down(va, size.bytes());
        let pa = align_down(pa, size.bytes());

        let walk = self.walk(va, size, Some(frames))?;
        if walk.level != size.level() {
            return Err(MmuError::AlreadyMapped);
        }
        let entry = walk.table.entry_mut(walk.index);
        if entry.is_table() {
            return Err(MmuError::Occupied);
        }
        entry.set(pa, flags | PteFlags::VALID);
        tlb::flush_page(va);
        log::trace!("[MMU] map {va:#x} -> {pa:#x} ({size:?}, {flags:?})");
        Ok(())
    }

    /// Map `size` bytes with 4 KiB leaves.
    pub fn map_region(
        &mut self,
        va: usize,
        pa: usize,
        size: usize,
        flags: PteFlags,
        frames: &dyn PageAllocator,
    ) -> Result<MappingStats, MmuError> {
        let (mut va, mut pa, pages) = Self::page_span(va, pa, size)?;
        let mut stats = MappingStats::default();
        for _ in 0..pages {
            self.map_leaf(va, pa, flags, PageSize::Size4K, frames)?;
            stats.record(PageSize::Size4K);
            // wraps after the last page of the address space
            va = va.wrapping_add(PAGE_SIZE);
            pa = pa.wrapping_add(PAGE_SIZE);
        }
        Ok(stats)
    }

    /// Map `size` bytes with the largest leaves the alignment of `va` and
    /// `pa` allows: 1 GiB, then 2 MiB, then 4 KiB.
    pub fn map_region_large(
        &mut self,
        va: usize,
        pa: usize,
        size: usize,
        flags: PteFlags,
        frames: &dyn PageAllocator,
    ) -> Result<MappingStats, MmuError> {
        let (mut va, mut pa, pages) = Self::page_span(va, pa, size)?;
        let mut stats = MappingStats::default();
        let mut remaining = pages * PAGE_SIZE;
        while remaining > 0 {
            let leaf = [PageSize::Size1G, PageSize::Size2M]
                .into_iter()
                .find(|s| {
                    is_aligned(va, s.bytes()) && is_aligned(pa, s.bytes()) && remaining >= s.bytes()
                })
                .unwrap_or(PageSize::Size4K);

            self.map_leaf(va, pa, flags, leaf, frames)?;
            stats.record(leaf);
            remaining -= leaf.bytes();
            va = va.wrapping_add(leaf.bytes());
            pa = pa.wrapping_add(leaf.bytes());
        }
        log::debug!(
            "[MMU] mapped {} bytes: {} x 1G, {} x 2M, {} x 4K",
            stats.total_bytes(),
            stats.gigapages,
            stats.megapages,
            stats.pages
        );
        Ok(stats)
    }

    /// Remove the leaf mapping `va` and return the physical address it held.
    ///
    /// Tables left without any valid entry are freed, bottom up; the root
    /// is kept.
    pub fn unmap(&mut self, va: usize, frames: &dyn PageAllocator) -> Result<usize, MmuError> {
        let walk = self.walk(va, PageSize::Size4K, None)?;
        let entry = walk.table.entry_mut(walk.index);
        if !entry.is_leaf() {
            return Err(MmuError::NotMapped);
        }
        let pa = entry.address();
        entry.clear();
        let leaf_empty = walk.table.is_empty();
        let (mut level, crumbs) = (walk.level, walk.breadcrumbs);

        let size = PageSize::at_level(level).bytes();
        tlb::flush_page(align_down(va, size));

        if leaf_empty {
            while level < ROOT_LEVEL {
                let (Some(child), Some(parent)) = (crumbs.tables[level], crumbs.tables[level + 1])
                else {
                    break;
                };
                // SAFETY: both come from this walk
                let (child_table, parent_table) =
                    unsafe { (table_at(self.map, child), table_at(self.map, parent)) };
                if !child_table.is_empty() {
                    break;
                }
                parent_table.entry_mut(crumbs.indices[level + 1]).clear();
                frames.free_page(child);
                log::trace!("[MMU] reclaimed level {level} table {child:#x}");
                level += 1;
            }
            tlb::flush_page(va);
        }

        log::trace!("[MMU] unmap {va:#x} (was {pa:#x})");
        Ok(pa)
    }

    /// Translate `va` without creating anything.
    pub fn lookup(&self, va: usize) -> Option<Translation> {
        if !is_canonical(va) {
            return None;
        }
        let mut table_pa = self.root;
        for level in (0..=ROOT_LEVEL).rev() {
            // SAFETY: table_pa is the root or came from a table entry
            let table = unsafe { table_at(self.map, table_pa) };
            let entry = table.entry(vpn(va, level));
            if !entry.is_valid() {
                return None;
            }
            if entry.is_leaf() {
                let size = PageSize::at_level(level);
                return Some(Translation {
                    phys: entry.address() + (va & (size.bytes() - 1)),
                    flags: entry.flags(),
                    size,
                });
            }
            table_pa = entry.address();
        }
        None
    }

    /// Replace the permissions of the leaf mapping `va`; the frame stays.
    pub fn protect(&mut self, va: usize, flags: PteFlags) -> Result<(), MmuError> {
        if !flags.is_valid_leaf() {
            return Err(MmuError::InvalidFlags);
        }
        let walk = self.walk(va, PageSize::Size4K, None)?;
        let level = walk.level;
        let entry = walk.table.entry_mut(walk.index);
        if !entry.is_leaf() {
            return Err(MmuError::NotMapped);
        }
        entry.set_flags(flags | PteFlags::VALID);
        tlb::flush_page(align_down(va, PageSize::at_level(level).bytes()));
        Ok(())
    }

    /// Log every entry on the path to `va`.
    pub fn dump(&self, va: usize) {
        log::info!("[MMU] walk {va:#x} from root {:#x}", self.root);
        if !is_canonical(va) {
            log::info!("[MMU]   non-canonical");
            return;
        }
        let mut table_pa = self.root;
        for level in (0..=ROOT_LEVEL).rev() {
            // SAFETY: table_pa is the root or came from a table entry
            let table = unsafe { table_at(self.map, table_pa) };
            let index = vpn(va, level);
            let entry = table.entry(index);
            log::info!(
                "[MMU]   L{level}[{index:3}] = {:#018x} {:?}",
                entry.bits(),
                entry.flags()
            );
            if !entry.is_table() {
                return;
            }
            table_pa = entry.address();
        }
    }

    /// Page-align a request; returns `(va, pa, pages)`.
    ///
    /// The last page may be the top of the address space, but neither
    /// range may run past it.
    fn page_span(va: usize, pa: usize, size: usize) -> Result<(usize, usize, usize), MmuError> {
        let offset = va & (PAGE_SIZE - 1);
        if offset != pa & (PAGE_SIZE - 1) {
            return Err(MmuError::Misaligned);
        }
        let (start, phys) = (align_down(va, PAGE_SIZE), align_down(pa, PAGE_SIZE));
        let pages = offset
            .checked_add(size)
            .map(|bytes| div_round_up(bytes, PAGE_SIZE))
            .ok_or(MmuError::InvalidVirtualAddress)?;
        if let Some(last) = pages.checked_sub(1) {
            let span = last
                .checked_mul(PAGE_SIZE)
                .ok_or(MmuError::InvalidVirtualAddress)?;
            start
                .checked_add(span)
                .ok_or(MmuError::InvalidVirtualAddress)?;
            phys.checked_add(span).ok_or(MmuError::Misaligned)?;
        }
        Ok((start, phys, pages))
    }
}

/// # Safety
/// `pa` must be a page table reachable through `map`, not aliased elsewhere.
unsafe fn table_at<'t>(map: DirectMap, pa: usize) -> &'t mut PageTable {
    &mut *map.as_mut_ptr::<PageTable>(pa)
}

/// Unhook and free the tables a failed walk created.
///
/// `fresh[level]` holds the table created at `level`. They form one chain
/// below the highest of them, so clearing its parent entry detaches all.
fn release_fresh(
    map: DirectMap,
    crumbs: &Breadcrumbs,
    fresh: &[Option<usize>; ROOT_LEVEL + 1],
    frames: &dyn PageAllocator,
) {
    let Some(top) = (0..ROOT_LEVEL).rev().find(|&level| fresh[level].is_some()) else {
        return;
    };
    if let Some(parent) = crumbs.tables[top + 1] {
        // SAFETY: the parent was visited by the failed walk
        unsafe { table_at(map, parent) }
            .entry_mut(crumbs.indices[top + 1])
            .clear();
    }
    for &pa in fresh.iter().flatten() {
        frames.free_page(pa);
    }
}

/// Take a zeroed frame for a table.
fn alloc_table(frames: &dyn PageAllocator, map: DirectMap) -> Result<usize, MmuError> {
    let pa = frames.alloc_page().ok_or(MmuError::AllocationFailed)?;
    // SAFETY: the frame was just handed to us
    unsafe { map.zero_frames(pa, 1) };
    Ok(pa)
}
