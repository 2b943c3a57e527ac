use bitflags::bitflags;
use rvk_utils::{Link, Linked};

bitflags! {
    /// State of a physical frame descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PhysPageFlags: u8 {
        /// Block is on a free list
        const FREE     = 1 << 0;
        /// Block is handed out
        const USED     = 1 << 1;
        /// Frame is never managed (descriptor table, alignment hole)
        const RESERVED = 1 << 2;
        /// First frame of a block; `order` is meaningful
        const HEAD     = 1 << 3;
    }
}

/// A descriptor for a physical page frame.
///
/// Each managed frame has one `Page` in the descriptor table. Frames inside a
/// block other than the head carry no flags. Free-list links are indices into
/// the same table, so the allocator never writes into the frames it manages.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub flags: PhysPageFlags,
    /// Order of the block (only valid if HEAD is set)
    pub order: u8,
    /// Number of owners of a used block
    pub refcount: u16,
    pub link: Link,
}

impl Page {
    /// A descriptor for a frame the allocator must never hand out.
    pub const fn reserved() -> Self {
        Self {
            flags: PhysPageFlags::RESERVED,
            order: 0,
            refcount: 0,
            link: Link::UNLINKED,
        }
    }

    /// A frame inside a block, not its head.
    pub const fn tail() -> Self {
        Self {
            flags: PhysPageFlags::empty(),
            order: 0,
            refcount: 0,
            link: Link::UNLINKED,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags.contains(PhysPageFlags::FREE)
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.flags.contains(PhysPageFlags::HEAD)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags.contains(PhysPageFlags::USED)
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.flags.contains(PhysPageFlags::RESERVED)
    }

    /// Free head of a block of `order`.
    pub fn mark_free(&mut self, order: usize) {
        self.flags = PhysPageFlags::FREE | PhysPageFlags::HEAD;
        self.order = order as u8;
        self.refcount = 0;
    }

    /// Used head of a block of `order`, owned once.
    pub fn mark_used(&mut self, order: usize) {
        self.flags = PhysPageFlags::USED | PhysPageFlags::HEAD;
        self.order = order as u8;
        self.refcount = 1;
    }
}

impl Linked for Page {
    #[inline]
    fn link(&self) -> Link {
        self.link
    }

    #[inline]
    fn set_link(&mut self, link: Link) {
        self.link = link;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_stays_small() {
        assert_eq!(core::mem::size_of::<Page>(), 12);
    }

    #[test]
    fn test_state_transitions() {
        let mut page = Page::reserved();
        assert!(page.is_reserved());
        assert!(!page.is_head());

        page.mark_free(3);
        assert!(page.is_free() && page.is_head());
        assert_eq!(page.order, 3);

        page.mark_used(3);
        assert!(page.is_used() && !page.is_free());
        assert_eq!(page.refcount, 1);

        page = Page::tail();
        assert!(page.flags.is_empty());
    }
}
