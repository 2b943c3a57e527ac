#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Small shared building blocks for the kernel memory subsystem.

pub mod index_list;

pub use index_list::{IndexList, Link, LinkArena, Linked, NIL};

// Re-export spin crate types as our lock API
pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Whether `value` is a multiple of `align` (a power of two).
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Number of `unit`-sized chunks needed to cover `bytes`.
#[inline]
pub const fn div_round_up(bytes: usize, unit: usize) -> usize {
    bytes.div_ceil(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
        assert_eq!(div_round_up(1, 4096), 1);
        assert_eq!(div_round_up(8192, 4096), 2);
        assert_eq!(div_round_up(8193, 4096), 3);
    }

    #[test]
    fn test_spinlock_basic() {
        let lock = Mutex::new(42);
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 43;
        }
        assert_eq!(*lock.lock(), 43);
    }

    #[test]
    fn test_once_initializes_exactly_once() {
        static CELL: Once<usize> = Once::new();
        assert!(CELL.get().is_none());
        assert_eq!(*CELL.call_once(|| 7), 7);
        assert_eq!(*CELL.call_once(|| 9), 7);
    }
}
