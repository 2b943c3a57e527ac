//! Generic interrupt control wrapper.
//!
//! On riscv64 this toggles `sstatus.SIE`. Host builds (tests, `std`) keep a
//! per-thread flag instead so lock behaviour can be observed.

#[cfg(target_arch = "riscv64")]
use crate::riscv64::interrupts as arch_interrupts;
#[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
use std::cell::Cell;

#[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
mod mock {
    use std::cell::Cell;

    std::thread_local! {
        pub static ENABLED: Cell<bool> = const { Cell::new(true) };
    }
}

/// Disables interrupts and returns the previous state.
#[inline(always)]
pub fn disable() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        arch_interrupts::disable()
    }
    #[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
    {
        u64::from(mock::ENABLED.with(|e| e.replace(false)))
    }
    #[cfg(all(not(target_arch = "riscv64"), not(any(test, feature = "std"))))]
    {
        0
    }
}

/// Unconditionally enables interrupts.
///
/// # Safety
/// Interrupt handlers may run as soon as this returns; callers must not hold
/// any lock those handlers take.
#[inline(always)]
pub unsafe fn enable() {
    #[cfg(target_arch = "riscv64")]
    {
        unsafe { arch_interrupts::enable() };
    }
    #[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
    {
        mock::ENABLED.with(|e| e.set(true));
    }
}

/// Restores the state returned by [`disable`].
#[inline(always)]
pub fn restore(state: u64) {
    #[cfg(target_arch = "riscv64")]
    {
        arch_interrupts::restore(state);
    }
    #[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
    {
        if state != 0 {
            mock::ENABLED.with(|e| e.set(true));
        }
    }
    #[cfg(all(not(target_arch = "riscv64"), not(any(test, feature = "std"))))]
    {
        let _ = state;
    }
}

#[inline(always)]
pub fn is_enabled() -> bool {
    #[cfg(target_arch = "riscv64")]
    {
        arch_interrupts::is_enabled()
    }
    #[cfg(all(not(target_arch = "riscv64"), any(test, feature = "std")))]
    {
        mock::ENABLED.with(Cell::get)
    }
    #[cfg(all(not(target_arch = "riscv64"), not(any(test, feature = "std"))))]
    {
        true
    }
}
