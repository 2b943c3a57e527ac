//! Doubly-linked list whose links are indices into an arena.
//!
//! Allocator free lists never store pointers inside the memory they manage.
//! Each node is identified by a `u32` index (a frame number, a descriptor
//! slot) and its links live in whatever arena owns that index: the frame
//! descriptor table, a slab header, a region descriptor pool. The list
//! itself only records the head and the length.
//!
//! # Invariants
//! - A node is in at most one list at a time.
//! - `head.prev == NIL`; the last node has `next == NIL`.
//! - An empty list has `head == NIL` and `len == 0`.

/// Sentinel index meaning "no node".
pub const NIL: u32 = u32::MAX;

/// Link fields stored by the arena for each node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub prev: u32,
    pub next: u32,
}

impl Link {
    /// Link of a node that is not on any list.
    pub const UNLINKED: Link = Link {
        prev: NIL,
        next: NIL,
    };
}

impl Default for Link {
    fn default() -> Self {
        Self::UNLINKED
    }
}

/// Storage that holds the links of list nodes.
pub trait LinkArena {
    fn link(&self, index: u32) -> Link;
    fn set_link(&mut self, index: u32, link: Link);

    #[inline]
    fn set_next(&mut self, index: u32, next: u32) {
        let mut link = self.link(index);
        link.next = next;
        self.set_link(index, link);
    }

    #[inline]
    fn set_prev(&mut self, index: u32, prev: u32) {
        let mut link = self.link(index);
        link.prev = prev;
        self.set_link(index, link);
    }
}

/// A node type that carries its own [`Link`].
///
/// A slice of such nodes is a [`LinkArena`] indexed by position.
pub trait Linked {
    fn link(&self) -> Link;
    fn set_link(&mut self, link: Link);
}

impl Linked for Link {
    fn link(&self) -> Link {
        *self
    }

    fn set_link(&mut self, link: Link) {
        *self = link;
    }
}

impl<T: Linked> LinkArena for [T] {
    fn link(&self, index: u32) -> Link {
        self[index as usize].link()
    }

    fn set_link(&mut self, index: u32, link: Link) {
        self[index as usize].set_link(link);
    }
}

/// Head of an index-linked list.
#[derive(Debug)]
pub struct IndexList {
    head: u32,
    len: usize,
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexList {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First node, if any.
    #[inline]
    pub fn head(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Insert `index` at the front. O(1).
    ///
    /// `index` must not already be on a list.
    pub fn push_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A, index: u32) {
        arena.set_link(
            index,
            Link {
                prev: NIL,
                next: self.head,
            },
        );
        if self.head != NIL {
            arena.set_prev(self.head, index);
        }
        self.head = index;
        self.len += 1;
    }

    /// Insert `index` right after `after`, or at the front when `after` is `None`.
    ///
    /// `after` must be on this list; `index` must not be on any list.
    pub fn insert_after<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        after: Option<u32>,
        index: u32,
    ) {
        let Some(after) = after else {
            self.push_front(arena, index);
            return;
        };

        let next = arena.link(after).next;
        arena.set_link(index, Link { prev: after, next });
        arena.set_next(after, index);
        if next != NIL {
            arena.set_prev(next, index);
        }
        self.len += 1;
    }

    /// Unlink `index` from this list. O(1).
    ///
    /// `index` must be on this list.
    pub fn remove<A: LinkArena + ?Sized>(&mut self, arena: &mut A, index: u32) {
        let Link { prev, next } = arena.link(index);

        if prev == NIL {
            self.head = next;
        } else {
            arena.set_next(prev, next);
        }
        if next != NIL {
            arena.set_prev(next, prev);
        }

        arena.set_link(index, Link::UNLINKED);
        self.len -= 1;
    }

    /// Remove and return the first node.
    pub fn pop_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A) -> Option<u32> {
        let head = self.head()?;
        self.remove(arena, head);
        Some(head)
    }

    /// Iterate over node indices from head to tail.
    pub fn iter<'a, A: LinkArena + ?Sized>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            cursor: self.head,
        }
    }

    /// Whether `index` is reachable from the head. O(n).
    pub fn contains<A: LinkArena + ?Sized>(&self, arena: &A, index: u32) -> bool {
        self.iter(arena).any(|i| i == index)
    }
}

/// Iterator over the indices of an [`IndexList`].
pub struct Iter<'a, A: LinkArena + ?Sized> {
    arena: &'a A,
    cursor: u32,
}

impl<A: LinkArena + ?Sized> Iterator for Iter<'_, A> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let current = self.cursor;
        self.cursor = self.arena.link(current).next;
        Some(current)
    }
}
