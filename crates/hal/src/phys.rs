//! Physical/virtual conversion for memory the kernel reaches directly.
//!
//! The kernel touches frame descriptors, slab headers and page tables through
//! a linear window: `va = pa + offset`. Under the boot identity map the offset
//! is zero. Host tests point the window at an ordinary heap buffer.

use crate::allocator::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// `va == pa`
    pub const IDENTITY: Self = Self { offset: 0 };

    pub const fn with_offset(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(self) -> usize {
        self.offset
    }

    #[inline]
    pub const fn phys_to_virt(self, pa: usize) -> usize {
        pa.wrapping_add(self.offset)
    }

    #[inline]
    pub const fn virt_to_phys(self, va: usize) -> usize {
        va.wrapping_sub(self.offset)
    }

    #[inline]
    pub fn as_mut_ptr<T>(self, pa: usize) -> *mut T {
        self.phys_to_virt(pa) as *mut T
    }

    /// Fill `count` frames starting at `pa` with zeroes.
    ///
    /// # Safety
    /// The frames must be owned by the caller and reachable through this window.
    pub unsafe fn zero_frames(self, pa: usize, count: usize) {
        core::ptr::write_bytes(self.as_mut_ptr::<u8>(pa), 0, count * PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_offset() {
        assert_eq!(DirectMap::IDENTITY.phys_to_virt(0x8000_1000), 0x8000_1000);

        let map = DirectMap::with_offset(0x1000_0000);
        assert_eq!(map.phys_to_virt(0x8000_0000), 0x9000_0000);
        assert_eq!(map.virt_to_phys(0x9000_0040), 0x8000_0040);
    }

    #[test]
    fn test_negative_offset_wraps() {
        // Host buffers usually sit below the fake physical base.
        let map = DirectMap::with_offset(0x10_0000usize.wrapping_sub(0x8000_0000));
        assert_eq!(map.phys_to_virt(0x8000_0000), 0x10_0000);
        assert_eq!(map.virt_to_phys(0x10_2000), 0x8000_2000);
    }
}
