//! Supervisor CSRs and address-translation fences.

use core::arch::asm;

/// `sstatus.SIE`: supervisor interrupt enable.
pub const SSTATUS_SIE: usize = 1 << 1;

#[inline(always)]
pub fn read_sstatus() -> usize {
    let value: usize;
    // SAFETY: reading sstatus has no side effects
    unsafe { asm!("csrr {}, sstatus", out(reg) value, options(nomem, nostack)) };
    value
}

#[inline(always)]
pub fn read_satp() -> usize {
    let value: usize;
    // SAFETY: reading satp has no side effects
    unsafe { asm!("csrr {}, satp", out(reg) value, options(nomem, nostack)) };
    value
}

/// Install a new `satp` value and flush every translation.
///
/// # Safety
/// `satp` must describe a valid SV39 root that maps the currently executing
/// code and stack.
#[inline(always)]
pub unsafe fn write_satp(satp: usize) {
    asm!(
        "csrw satp, {}",
        "sfence.vma zero, zero",
        in(reg) satp,
        options(nostack)
    );
}

/// `sfence.vma va, zero`
#[inline(always)]
pub fn sfence_vma_page(va: usize) {
    // SAFETY: a fence only drops cached translations
    unsafe { asm!("sfence.vma {}, zero", in(reg) va, options(nostack)) };
}

/// `sfence.vma zero, asid`
#[inline(always)]
pub fn sfence_vma_asid(asid: usize) {
    // SAFETY: a fence only drops cached translations
    unsafe { asm!("sfence.vma zero, {}", in(reg) asid, options(nostack)) };
}

/// `sfence.vma zero, zero`
#[inline(always)]
pub fn sfence_vma_all() {
    // SAFETY: a fence only drops cached translations
    unsafe { asm!("sfence.vma zero, zero", options(nostack)) };
}
