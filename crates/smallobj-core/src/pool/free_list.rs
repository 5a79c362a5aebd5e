//! Segregated free lists.
//!
//! One intrusive singly linked list per size class. While a block sits on a
//! list its first word holds a [`FreeNode`]; once popped, the whole block
//! belongs to the caller again and the node is never read. All of the raw
//! reinterpretation between caller bytes and link words lives here.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use super::size_class::{NUM_SIZE_CLASSES, class_size};

/// Link word stored at the start of a free block.
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Table of free-list heads, one per size class.
///
/// Invariant: every node reachable from head `i` is a block of exactly
/// `class_size(i)` bytes that no caller currently owns.
pub struct FreeLists {
    heads: [Option<NonNull<FreeNode>>; NUM_SIZE_CLASSES],
    lens: [usize; NUM_SIZE_CLASSES],
}

impl FreeLists {
    /// Creates a table of empty lists.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_SIZE_CLASSES],
            lens: [0; NUM_SIZE_CLASSES],
        }
    }

    /// Pops the head block of `class`, or `None` if the list is empty or the
    /// index is out of range.
    pub fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
        let node = (*self.heads.get(class)?)?;
        // SAFETY: nodes only enter a list through `push`/`link_chunk`, whose
        // callers hand over exclusive ownership of an aligned block holding
        // an initialized FreeNode.
        self.heads[class] = unsafe { node.as_ptr().read().next };
        self.lens[class] -= 1;
        Some(node.cast())
    }

    /// Pushes `block` onto the head of `class`.
    ///
    /// # Safety
    ///
    /// `block` must be `ALIGN`-aligned, span `class_size(class)` bytes, be
    /// owned by nobody else and not already be on any list. `class` must be
    /// below `NUM_SIZE_CLASSES`.
    pub unsafe fn push(&mut self, class: usize, block: NonNull<u8>) {
        debug_assert!(class < NUM_SIZE_CLASSES);
        let node = block.cast::<FreeNode>();
        // SAFETY: caller guarantees the block is exclusively ours and large
        // enough for one link word.
        unsafe {
            node.as_ptr().write(FreeNode {
                next: self.heads[class],
            });
        }
        self.heads[class] = Some(node);
        self.lens[class] += 1;
    }

    /// Carves `count` contiguous blocks of `class_size(class)` bytes starting
    /// at `first` and prepends them to `class`, lowest address first.
    ///
    /// # Safety
    ///
    /// `[first, first + count * class_size(class))` must be exclusively owned,
    /// `ALIGN`-aligned and disjoint from every listed or live block.
    pub unsafe fn link_chunk(&mut self, class: usize, first: NonNull<u8>, count: usize) {
        debug_assert!(class < NUM_SIZE_CLASSES);
        let size = class_size(class);
        let mut next = self.heads[class];
        for i in (0..count).rev() {
            // SAFETY: `i * size` stays inside the chunk the caller handed over.
            let node = unsafe { first.add(i * size) }.cast::<FreeNode>();
            // SAFETY: as above; the block is not yet visible to anyone.
            unsafe { node.as_ptr().write(FreeNode { next }) };
            next = Some(node);
        }
        self.heads[class] = next;
        self.lens[class] += count;
    }

    #[must_use]
    pub fn is_empty(&self, class: usize) -> bool {
        self.heads.get(class).is_none_or(Option::is_none)
    }

    /// Number of blocks on `class` (0 for out-of-range indices).
    #[must_use]
    pub fn len(&self, class: usize) -> usize {
        self.lens.get(class).copied().unwrap_or(0)
    }

    /// Total free blocks across all classes.
    #[must_use]
    pub fn total_free(&self) -> usize {
        self.lens.iter().sum()
    }

    /// Total free bytes across all classes.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.lens
            .iter()
            .enumerate()
            .map(|(class, &len)| len * class_size(class))
            .sum()
    }

    /// Walks `class` from head to tail.
    pub fn iter(&self, class: usize) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let mut cursor = self.heads.get(class).copied().flatten();
        std::iter::from_fn(move || {
            let node = cursor?;
            // SAFETY: see `pop`; the walk only reads link words.
            cursor = unsafe { node.as_ptr().read().next };
            Some(node.cast())
        })
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FreeLists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeLists")
            .field("lens", &self.lens)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Backing([u8; 512]);

    fn backing() -> Box<Backing> {
        Box::new(Backing([0; 512]))
    }

    fn base(b: &mut Backing) -> NonNull<u8> {
        NonNull::new(b.0.as_mut_ptr()).unwrap()
    }

    #[test]
    fn test_new_lists_empty() {
        let lists = FreeLists::new();
        for class in 0..NUM_SIZE_CLASSES {
            assert!(lists.is_empty(class));
            assert_eq!(lists.len(class), 0);
        }
        assert_eq!(lists.total_free(), 0);
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let mut lists = FreeLists::new();
        assert!(lists.pop(0).is_none());
        assert!(lists.pop(NUM_SIZE_CLASSES).is_none());
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut mem = backing();
        let p = base(&mut mem);
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(1, p);
            lists.push(1, p.add(16));
        }
        assert_eq!(lists.len(1), 2);
        assert_eq!(lists.pop(1), Some(unsafe { p.add(16) }));
        assert_eq!(lists.pop(1), Some(p));
        assert!(lists.pop(1).is_none());
    }

    #[test]
    fn test_classes_independent() {
        let mut mem = backing();
        let p = base(&mut mem);
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(0, p);
            lists.push(5, p.add(64));
        }
        assert_eq!(lists.pop(0), Some(p));
        assert!(lists.pop(0).is_none());
        assert_eq!(lists.pop(5), Some(unsafe { p.add(64) }));
        assert_eq!(lists.total_free(), 0);
    }

    #[test]
    fn test_link_chunk_ascending() {
        let mut mem = backing();
        let p = base(&mut mem);
        let mut lists = FreeLists::new();
        unsafe { lists.link_chunk(3, p, 4) };
        assert_eq!(lists.len(3), 4);
        assert_eq!(lists.free_bytes(), 4 * 32);
        let walked: Vec<usize> = lists.iter(3).map(|n| n.as_ptr() as usize).collect();
        let expected: Vec<usize> = (0..4).map(|i| p.as_ptr() as usize + i * 32).collect();
        assert_eq!(walked, expected);
    }

    #[test]
    fn test_link_chunk_keeps_existing_tail() {
        let mut mem = backing();
        let p = base(&mut mem);
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(0, p.add(256));
            lists.link_chunk(0, p, 2);
        }
        let walked: Vec<usize> = lists.iter(0).map(|n| n.as_ptr() as usize).collect();
        let b = p.as_ptr() as usize;
        assert_eq!(walked, vec![b, b + 8, b + 256]);
    }
}
