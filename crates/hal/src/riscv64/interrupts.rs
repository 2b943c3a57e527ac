//! Supervisor interrupt masking through `sstatus.SIE`.

use super::csr::{SSTATUS_SIE, read_sstatus};
use core::arch::asm;

/// Clear `sstatus.SIE` and return the previous `sstatus` value.
#[inline(always)]
pub fn disable() -> u64 {
    let prev: usize;
    // SAFETY: csrrci atomically clears SIE and returns the old register
    unsafe { asm!("csrrci {}, sstatus, 2", out(reg) prev, options(nomem, nostack)) };
    prev as u64
}

/// # Safety
/// Interrupt handlers may run immediately after this returns.
#[inline(always)]
pub unsafe fn enable() {
    asm!("csrsi sstatus, 2", options(nomem, nostack));
}

/// Set SIE again only if it was set in `state`.
#[inline(always)]
pub fn restore(state: u64) {
    if state as usize & SSTATUS_SIE != 0 {
        // SAFETY: re-enabling interrupts that were enabled before `disable`
        unsafe { enable() };
    }
}

#[inline(always)]
pub fn is_enabled() -> bool {
    read_sstatus() & SSTATUS_SIE != 0
}
