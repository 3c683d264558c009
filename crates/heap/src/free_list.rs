//! Size-classed free lists.
//!
//! Each class is a circular doubly-linked list whose links live inside the
//! free blocks themselves: the first 16 payload bytes of a free block hold
//! the successor and predecessor offsets. The allocator-side state is one
//! head offset per class ([`NIL`] when empty). Insertion is LIFO at the
//! head; the fit scan walks forward from the head, so ties resolve to the
//! most recently inserted block.

use crate::block::{self, NIL};
use crate::region::HeapRegion;

/// Number of size classes. Class 0 holds exactly the minimum block size;
/// class `i` holds `(32·2^(i-1), 32·2^i]`; the last class is unbounded.
pub const NUM_FREE_LISTS: usize = 10;

/// Per-class heads of the segregated free lists.
#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [usize; NUM_FREE_LISTS],
}

const NEXT_SLOT: usize = 16;
const PREV_SLOT: usize = 24;

fn decode_link(raw: u64) -> usize {
    if raw == u64::MAX { NIL } else { raw as usize }
}

fn encode_link(offset: usize) -> u64 {
    if offset == NIL { u64::MAX } else { offset as u64 }
}

impl FreeLists {
    pub(crate) fn new() -> Self {
        Self {
            heads: [NIL; NUM_FREE_LISTS],
        }
    }

    /// Size class serving blocks of `block_size` bytes.
    pub(crate) fn class_of(block_size: usize) -> usize {
        if block_size <= block::MIN_BLOCK_SIZE {
            return 0;
        }
        let mut bound = block::MIN_BLOCK_SIZE;
        for class in 1..NUM_FREE_LISTS - 1 {
            bound <<= 1;
            if block_size <= bound {
                return class;
            }
        }
        NUM_FREE_LISTS - 1
    }

    fn next_of(region: &HeapRegion, b: usize) -> usize {
        // SAFETY: link slots sit inside a live free block's payload.
        decode_link(unsafe { region.read_u64(b + NEXT_SLOT) })
    }

    fn prev_of(region: &HeapRegion, b: usize) -> usize {
        // SAFETY: as above.
        decode_link(unsafe { region.read_u64(b + PREV_SLOT) })
    }

    fn set_next(region: &mut HeapRegion, b: usize, to: usize) {
        // SAFETY: as above.
        unsafe { region.write_u64(b + NEXT_SLOT, encode_link(to)) };
    }

    fn set_prev(region: &mut HeapRegion, b: usize, to: usize) {
        // SAFETY: as above.
        unsafe { region.write_u64(b + PREV_SLOT, encode_link(to)) };
    }

    /// Insert the free block at `b` at the head of its size class.
    pub(crate) fn insert(&mut self, region: &mut HeapRegion, b: usize) {
        let class = Self::class_of(block::load_header(region, b).block_size());
        match self.heads[class] {
            NIL => {
                Self::set_next(region, b, b);
                Self::set_prev(region, b, b);
            }
            head => {
                let tail = Self::prev_of(region, head);
                Self::set_next(region, b, head);
                Self::set_prev(region, b, tail);
                Self::set_next(region, tail, b);
                Self::set_prev(region, head, b);
            }
        }
        self.heads[class] = b;
    }

    /// Unlink the free block at `b` from its size class.
    pub(crate) fn remove(&mut self, region: &mut HeapRegion, b: usize) {
        let class = Self::class_of(block::load_header(region, b).block_size());
        let next = Self::next_of(region, b);
        if next == b {
            self.heads[class] = NIL;
            return;
        }
        let prev = Self::prev_of(region, b);
        Self::set_next(region, prev, next);
        Self::set_prev(region, next, prev);
        if self.heads[class] == b {
            self.heads[class] = next;
        }
    }

    /// First-fit search for a block of at least `needed` bytes, scanning
    /// classes upward from the one `needed` maps to. The block stays linked;
    /// the caller removes it once committed.
    pub(crate) fn find(&self, region: &HeapRegion, needed: usize) -> Option<usize> {
        for class in Self::class_of(needed)..NUM_FREE_LISTS {
            let head = self.heads[class];
            if head == NIL {
                continue;
            }
            let mut b = head;
            loop {
                if block::load_header(region, b).block_size() >= needed {
                    return Some(b);
                }
                b = Self::next_of(region, b);
                if b == head {
                    break;
                }
            }
        }
        None
    }

    /// Members of one class in list order, verifying link reciprocity along
    /// the way. Used by the consistency audit.
    pub(crate) fn members(
        &self,
        region: &HeapRegion,
        class: usize,
    ) -> Result<Vec<usize>, String> {
        let head = self.heads[class];
        if head == NIL {
            return Ok(Vec::new());
        }
        let bound = region.len() / block::MIN_BLOCK_SIZE + 1;
        let mut out = Vec::new();
        let mut b = head;
        loop {
            let next = Self::next_of(region, b);
            let prev = Self::prev_of(region, b);
            if next == NIL || prev == NIL {
                return Err(format!("free list {class} holds a nil link at {b:#x}"));
            }
            if Self::prev_of(region, next) != b || Self::next_of(region, prev) != b {
                return Err(format!("free list {class} links not reciprocal at {b:#x}"));
            }
            out.push(b);
            if out.len() > bound {
                return Err(format!("free list {class} does not close into a cycle"));
            }
            b = next;
            if b == head {
                break;
            }
        }
        Ok(out)
    }
}
