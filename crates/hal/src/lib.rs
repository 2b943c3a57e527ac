#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Memory management for a RISC-V (SV39) kernel.
//!
//! Components, in boot order:
//! - [`memory`]: buddy frame allocator over the physical RAM range
//! - [`allocator::slab`]: object caches and `kalloc`/`kfree`
//! - [`mmu`]: the kernel's three-level page table
//! - [`vmalloc`]: vmalloc/vmap/ioremap regions in a reserved virtual window
//!
//! [`mm::MemorySubsystem`] ties them together and [`mm::init`] installs the
//! global instance.

pub mod allocator;
pub mod config;
pub mod interrupts;
pub mod memory;
pub mod mm;
pub mod mmu;
pub mod phys;
pub mod traits;
pub mod vmalloc;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(test)]
mod testing;

pub use config::{CorruptionPolicy, MmConfig};
pub use memory::{FrameAllocator, FrameStats};
pub use mm::{KernelHeap, MemorySubsystem, MmError};
pub use mmu::{KernelPageTable, MmuError, PageSize, PteFlags};
pub use phys::DirectMap;
pub use traits::PageAllocator;
pub use vmalloc::{RegionKind, VmError, VmRegion, VmallocArea};

use core::mem::ManuallyDrop;
use rvk_utils::{Mutex, MutexGuard};

/// Spinlock that keeps interrupts masked while held.
///
/// The previous interrupt state is saved on `lock` and restored after the
/// inner guard is released, so nested locks restore correctly.
pub struct IrqSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> IrqSafeLockGuard<'_, T> {
        let state = interrupts::disable();
        let guard = self.inner.lock();
        IrqSafeLockGuard {
            guard: ManuallyDrop::new(guard),
            state,
        }
    }

    /// Non-blocking variant of [`lock`](Self::lock).
    pub fn try_lock(&self) -> Option<IrqSafeLockGuard<'_, T>> {
        let state = interrupts::disable();
        if let Some(guard) = self.inner.try_lock() {
            Some(IrqSafeLockGuard {
                guard: ManuallyDrop::new(guard),
                state,
            })
        } else {
            interrupts::restore(state);
            None
        }
    }
}

pub struct IrqSafeLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    state: u64,
}

impl<T> core::ops::Deref for IrqSafeLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for IrqSafeLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSafeLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here, before interrupts come back
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::restore(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_masks_interrupts_while_held() {
        let lock = IrqSafeLock::new(10);
        assert!(interrupts::is_enabled());
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 10);
            *guard = 20;
            assert!(!interrupts::is_enabled());
        }
        assert!(interrupts::is_enabled());
        assert_eq!(*lock.lock(), 20);
    }

    #[test]
    fn test_nested_locks_restore_outer_state() {
        let frames = IrqSafeLock::new(1);
        let slab = IrqSafeLock::new(2);
        {
            let _outer = slab.lock();
            {
                let _inner = frames.lock();
                assert!(!interrupts::is_enabled());
            }
            assert!(!interrupts::is_enabled(), "inner drop must not unmask");
        }
        assert!(interrupts::is_enabled());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = IrqSafeLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        assert!(!interrupts::is_enabled());
        drop(held);
        assert!(interrupts::is_enabled());
        assert!(lock.try_lock().is_some());
    }
}
