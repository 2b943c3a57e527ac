//! Boot-time configuration of the memory subsystem.

use crate::allocator::PAGE_SIZE;
use crate::allocator::slab::{KMALLOC_CLASSES, MAX_CACHES};
use crate::mm::MmError;
use crate::mmu::is_canonical;
use core::fmt::Display;
use rvk_utils::is_aligned;

/// What to do when a free request turns out to be corrupt (wrong owner,
/// order mismatch, not a block head, foreign region kind).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Log at error level and ignore the request.
    Report,
    /// Panic immediately.
    Panic,
}

impl CorruptionPolicy {
    pub const DEFAULT: Self = if cfg!(feature = "strict-free") {
        Self::Panic
    } else {
        Self::Report
    };

    /// Apply the policy to a corruption report from `component`.
    #[allow(clippy::panic)]
    pub fn handle(self, component: &str, err: &dyn Display) {
        match self {
            Self::Report => log::error!("[{component}] rejected free: {err}"),
            Self::Panic => panic!("[{component}] corrupted free: {err}"),
        }
    }
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmConfig {
    /// Physical address of the first byte of RAM.
    pub phys_base: usize,
    /// Bytes of RAM starting at `phys_base`.
    pub phys_size: usize,
    /// Bytes at the start of RAM holding the kernel image. Never managed.
    pub kernel_reserved: usize,
    /// Start of the virtual window for vmalloc/vmap/ioremap.
    pub vmalloc_start: usize,
    pub vmalloc_size: usize,
    /// Region descriptor pool capacity.
    pub max_regions: usize,
    /// Slab cache table capacity, including the kmalloc size classes.
    pub max_caches: usize,
    /// Identity-map all of RAM with the largest leaves that fit.
    pub identity_map: bool,
    /// Write `satp` once the kernel table is built.
    pub enable_translation: bool,
    pub policy: CorruptionPolicy,
}

impl MmConfig {
    /// QEMU `virt` machine: 128 MiB at 0x8000_0000, 4 MiB kernel image.
    pub const fn qemu_virt() -> Self {
        Self {
            phys_base: 0x8000_0000,
            phys_size: 128 * 1024 * 1024,
            kernel_reserved: 4 * 1024 * 1024,
            vmalloc_start: 0xFFFF_FFD0_0000_0000,
            vmalloc_size: 64 * 1024 * 1024,
            max_regions: 64,
            max_caches: 16,
            identity_map: true,
            enable_translation: true,
            policy: CorruptionPolicy::DEFAULT,
        }
    }

    pub const fn phys_end(&self) -> usize {
        self.phys_base + self.phys_size
    }

    pub const fn vmalloc_end(&self) -> usize {
        self.vmalloc_start + self.vmalloc_size
    }

    /// First physical address handed to the frame allocator.
    pub const fn managed_start(&self) -> usize {
        self.phys_base + self.kernel_reserved
    }

    pub fn validate(&self) -> Result<(), MmError> {
        let ram_ok = is_aligned(self.phys_base, PAGE_SIZE)
            && is_aligned(self.phys_size, PAGE_SIZE)
            && is_aligned(self.kernel_reserved, PAGE_SIZE)
            && self.phys_base.checked_add(self.phys_size).is_some()
            && self.kernel_reserved < self.phys_size;

        let window_ok = self.vmalloc_size > 0
            && is_aligned(self.vmalloc_start, PAGE_SIZE)
            && is_aligned(self.vmalloc_size, PAGE_SIZE)
            && self.vmalloc_start.checked_add(self.vmalloc_size).is_some()
            && is_canonical(self.vmalloc_start)
            && is_canonical(self.vmalloc_end() - 1);

        let disjoint = ram_ok
            && window_ok
            && (self.vmalloc_end() <= self.phys_base || self.vmalloc_start >= self.phys_end());

        let pools_ok = self.max_regions > 0
            && self.max_caches >= KMALLOC_CLASSES.len()
            && self.max_caches <= MAX_CACHES;

        if disjoint && pools_ok {
            Ok(())
        } else {
            Err(MmError::InvalidConfig)
        }
    }
}

impl Default for MmConfig {
    fn default() -> Self {
        Self::qemu_virt()
    }
}
