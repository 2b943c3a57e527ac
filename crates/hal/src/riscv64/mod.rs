//! RISC-V (RV64, supervisor mode) primitives used by the memory subsystem.
//!
//! Everything here is a thin wrapper around a CSR access or a fence
//! instruction. Only compiled for `target_arch = "riscv64"`; host builds use
//! the stubs in [`crate::interrupts`] and [`crate::mmu::tlb`].

pub mod csr;
pub mod interrupts;
