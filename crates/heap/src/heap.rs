//! The segregated-fit heap engine.

use std::ptr::NonNull;

use tracing::{debug, error};

use crate::block::{
    self, FLAG_ALLOCATED, FLAG_IN_QUICK_LIST, FLAG_PREV_ALLOCATED, Header, MIN_BLOCK_SIZE,
};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::free_list::{FreeLists, NUM_FREE_LISTS};
use crate::quick_list::{NUM_QUICK_LISTS, QuickLists};
use crate::region::{HeapRegion, PAGE_SIZE};
use crate::stats::HeapStats;

/// Struct offset of the prologue sentinel. Its never-read prev-footer slot
/// doubles as the leading pad that lands every payload on a 16-byte boundary.
const PROLOGUE: usize = 0;

/// Struct offset of the first real block.
const FIRST_BLOCK: usize = MIN_BLOCK_SIZE;

/// Payload bytes start this far into a block struct.
const PAYLOAD_OFFSET: usize = 16;

/// Bytes the epilogue occupies at the committed end.
const EPILOGUE_FOOTPRINT: usize = 16;

/// A single-threaded segregated-fit allocator over a page-growable region.
///
/// Payload pointers handed out by [`alloc`](Self::alloc) and
/// [`realloc`](Self::realloc) are 16-byte aligned and stable until freed; the
/// engine itself works in region offsets. Freeing small blocks parks them in
/// exact-size quick lists, deferring coalescing until a stack overflows;
/// everything else coalesces immediately, so two adjacent free non-parked
/// blocks never exist.
pub struct SegHeap {
    region: HeapRegion,
    config: HeapConfig,
    free: FreeLists,
    quick: QuickLists,
    live_payload: u64,
    peak_payload: f64,
}

impl SegHeap {
    /// Build a heap with the default [`HeapConfig`].
    pub fn new() -> HeapResult<Self> {
        Self::with_config(HeapConfig::default())
    }

    /// Build a heap with an explicit configuration. Address space is reserved
    /// here; no page is committed until the first allocation.
    pub fn with_config(config: HeapConfig) -> HeapResult<Self> {
        config.validate()?;
        Ok(Self {
            region: HeapRegion::reserve(config.max_pages)?,
            config,
            free: FreeLists::new(),
            quick: QuickLists::new(),
            live_payload: 0,
            peak_payload: 0.0,
        })
    }

    /// Allocate `size` payload bytes.
    ///
    /// # Errors
    ///
    /// [`HeapError::ZeroSize`] for `size == 0`, [`HeapError::SizeOverflow`]
    /// when the effective-size computation wraps, and
    /// [`HeapError::OutOfMemory`] when the region cannot grow far enough.
    pub fn alloc(&mut self, size: usize) -> HeapResult<NonNull<u8>> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let needed =
            block::effective_size(size).ok_or(HeapError::SizeOverflow { requested: size })?;
        if self.region.len() == 0 {
            self.bootstrap()?;
        }

        if let Some(index) = QuickLists::index_of(needed) {
            if let Some(b) = self.quick.pop(&self.region, index) {
                let parked = self.header(b);
                let header = Header::pack(
                    needed,
                    size,
                    FLAG_ALLOCATED | parked.prev_allocated_flag(),
                );
                self.set_header(b, header);
                block::store_footer(&mut self.region, b, header);
                self.flag_next(b, needed, FLAG_PREV_ALLOCATED, true);
                self.credit_payload(size);
                return Ok(self.payload_ptr(b));
            }
        }

        loop {
            if let Some(b) = self.free.find(&self.region, needed) {
                return Ok(self.place(b, needed, size));
            }
            self.grow_one_page()?;
        }
    }

    /// Release the allocation at `ptr`.
    ///
    /// Any detectable misuse (null or misaligned pointer, pointer outside
    /// the heap, damaged block metadata, double free) aborts the process:
    /// such a call is undefined behaviour on the caller's side.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) or
    /// [`realloc`](Self::realloc) on this heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let b = self.checked_block_of(ptr);
        let header = self.header(b);
        let size = header.block_size();
        self.debit_payload(header.payload_size());

        if self.config.quick_list_cap > 0 {
            if let Some(index) = QuickLists::index_of(size) {
                if self.quick.len(index) >= self.config.quick_list_cap {
                    self.flush_quick_list(index);
                }
                self.set_header(b, header.with_flag(FLAG_IN_QUICK_LIST));
                self.quick.push(&mut self.region, index, b);
                return;
            }
        }

        let freed = Header::pack(size, 0, header.prev_allocated_flag());
        self.set_header(b, freed);
        block::store_footer(&mut self.region, b, freed);
        self.coalesce_and_insert(b);
    }

    /// Resize the allocation at `ptr` to `new_size` payload bytes.
    ///
    /// Shrinks happen in place (splitting off a free suffix when at least a
    /// minimum block remains); growth allocates fresh space, copies
    /// `min(old payload, new_size)` bytes, and frees the original.
    /// `new_size == 0` frees the allocation and returns `Ok(None)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free); invalid pointers abort.
    pub unsafe fn realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> HeapResult<Option<NonNull<u8>>> {
        if new_size == 0 {
            // SAFETY: caller contract forwarded.
            unsafe { self.free(ptr) };
            return Ok(None);
        }
        let b = self.checked_block_of(ptr);
        let needed = block::effective_size(new_size).ok_or(HeapError::SizeOverflow {
            requested: new_size,
        })?;
        let header = self.header(b);
        let size = header.block_size();
        let old_payload = header.payload_size();

        if needed <= size {
            let remainder = size - needed;
            if remainder >= MIN_BLOCK_SIZE {
                let kept = Header::pack(
                    needed,
                    new_size,
                    FLAG_ALLOCATED | header.prev_allocated_flag(),
                );
                self.set_header(b, kept);
                let suffix = b + needed;
                let sh = Header::pack(remainder, 0, FLAG_PREV_ALLOCATED);
                self.set_header(suffix, sh);
                block::store_footer(&mut self.region, suffix, sh);
                self.coalesce_and_insert(suffix);
            } else {
                self.set_header(b, header.with_payload_size(new_size));
            }
            self.debit_payload(old_payload);
            self.credit_payload(new_size);
            return Ok(Some(self.payload_ptr(b)));
        }

        let fresh = self.alloc(new_size)?;
        let keep = old_payload.min(new_size);
        // SAFETY: both blocks are live, non-overlapping, and at least `keep`
        // bytes long.
        unsafe { std::ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), keep) };
        // SAFETY: caller contract forwarded; `ptr` is still live here.
        unsafe { self.free(ptr) };
        Ok(Some(fresh))
    }

    /// Payload-to-footprint ratio over allocated, non-parked blocks; `0.0`
    /// when there are none.
    pub fn internal_fragmentation(&self) -> f64 {
        let mut payload = 0u64;
        let mut footprint = 0u64;
        for (offset, header) in self.blocks() {
            if offset == PROLOGUE || header.block_size() == 0 {
                continue;
            }
            if header.is_allocated() && !header.in_quick_list() {
                payload += header.payload_size() as u64;
                footprint += header.block_size() as u64;
            }
        }
        if footprint == 0 {
            0.0
        } else {
            payload as f64 / footprint as f64
        }
    }

    /// Highest aggregate payload ever live, divided by the current heap
    /// size; `0.0` before the first page is committed.
    pub fn peak_utilization(&self) -> f64 {
        if self.region.len() == 0 {
            0.0
        } else {
            self.peak_payload / self.region.len() as f64
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            committed_pages: self.region.committed_pages(),
            committed_bytes: self.region.len(),
            live_payload: self.live_payload,
            peak_payload: self.peak_payload,
            ..HeapStats::default()
        };
        for (offset, header) in self.blocks() {
            if offset == PROLOGUE || header.block_size() == 0 {
                continue;
            }
            if header.in_quick_list() {
                stats.quick_cached += 1;
            } else if header.is_allocated() {
                stats.allocated_blocks += 1;
            } else {
                stats.free_blocks += 1;
            }
        }
        stats
    }

    /// Audit every structural invariant: exact tiling from prologue to
    /// epilogue, footer mirrors, prev-allocated agreement, no uncoalesced
    /// neighbours, and exact membership of the free and quick lists.
    pub fn check_consistency(&self) -> HeapResult<()> {
        if self.region.len() == 0 {
            return Ok(());
        }
        let epilogue = self.epilogue_offset();

        let prologue = self.header(PROLOGUE);
        if prologue.block_size() != MIN_BLOCK_SIZE || !prologue.is_allocated() {
            return Self::broken(PROLOGUE, "prologue sentinel damaged");
        }

        let mut free_seen = Vec::new();
        let mut quick_seen = Vec::new();
        let mut offset = FIRST_BLOCK;
        let mut prev_allocated = true;
        let mut prev_header = prologue;
        let mut prev_was_free = false;

        loop {
            if offset > epilogue {
                return Self::broken(offset, "block walk overran the epilogue");
            }
            let header = self.header(offset);
            if header.is_prev_allocated() != prev_allocated {
                return Self::broken(offset, "prev-allocated bit disagrees with predecessor");
            }
            if !prev_allocated && block::load_prev_footer(&self.region, offset) != prev_header {
                return Self::broken(offset, "footer does not mirror predecessor header");
            }
            if offset == epilogue {
                if header.block_size() != 0 || !header.is_allocated() {
                    return Self::broken(offset, "epilogue sentinel damaged");
                }
                break;
            }

            let size = header.block_size();
            if size < MIN_BLOCK_SIZE || size % block::ALIGNMENT != 0 {
                return Self::broken(offset, "block size out of range");
            }
            if offset + size > epilogue {
                return Self::broken(offset, "block extends past the epilogue");
            }
            if header.in_quick_list() && !header.is_allocated() {
                return Self::broken(offset, "quick-list block lost its allocated bit");
            }
            let is_free = !header.is_allocated();
            if is_free && prev_was_free {
                return Self::broken(offset, "adjacent free blocks not coalesced");
            }
            if is_free {
                free_seen.push(offset);
            }
            if header.in_quick_list() {
                quick_seen.push((offset, size));
            }

            prev_allocated = header.is_allocated();
            prev_was_free = is_free;
            prev_header = header;
            offset += size;
        }

        let mut listed = Vec::new();
        for class in 0..NUM_FREE_LISTS {
            let members = self
                .free
                .members(&self.region, class)
                .map_err(|detail| HeapError::Inconsistent { offset: 0, detail })?;
            for b in members {
                let header = self.header(b);
                if header.is_allocated() {
                    return Self::broken(b, "free list holds an allocated block");
                }
                if FreeLists::class_of(header.block_size()) != class {
                    return Self::broken(b, "block filed in the wrong size class");
                }
                listed.push(b);
            }
        }
        listed.sort_unstable();
        if listed != free_seen {
            return Self::broken(0, "free-list membership disagrees with the block walk");
        }

        let mut parked = Vec::new();
        for index in 0..NUM_QUICK_LISTS {
            let expected = MIN_BLOCK_SIZE + index * block::ALIGNMENT;
            let members = self.quick.members(&self.region, index);
            if members.len() != self.quick.len(index) {
                return Self::broken(0, "quick-list length disagrees with its links");
            }
            for b in members {
                let header = self.header(b);
                if !header.is_allocated() || !header.in_quick_list() {
                    return Self::broken(b, "quick list holds a non-parked block");
                }
                if header.block_size() != expected {
                    return Self::broken(b, "quick list holds a block of the wrong size");
                }
                parked.push(b);
            }
        }
        parked.sort_unstable();
        let mut walked: Vec<usize> = quick_seen.iter().map(|&(b, _)| b).collect();
        walked.sort_unstable();
        if parked != walked {
            return Self::broken(0, "quick-list membership disagrees with the block walk");
        }

        Ok(())
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn broken(offset: usize, detail: &str) -> HeapResult<()> {
        Err(HeapError::Inconsistent {
            offset,
            detail: detail.into(),
        })
    }

    fn header(&self, b: usize) -> Header {
        block::load_header(&self.region, b)
    }

    fn set_header(&mut self, b: usize, header: Header) {
        block::store_header(&mut self.region, b, header);
    }

    fn epilogue_offset(&self) -> usize {
        self.region.len() - EPILOGUE_FOOTPRINT
    }

    fn payload_ptr(&self, b: usize) -> NonNull<u8> {
        // SAFETY: the region base is non-null and the offset stays inside the
        // reservation, so the sum cannot be null.
        unsafe { NonNull::new_unchecked(self.region.ptr_at(b + PAYLOAD_OFFSET)) }
    }

    /// Commit the first page and lay out pad, prologue, one spanning free
    /// block, and the epilogue.
    fn bootstrap(&mut self) -> HeapResult<()> {
        self.grow_region()?;

        let prologue = Header::pack(MIN_BLOCK_SIZE, 0, FLAG_ALLOCATED | FLAG_PREV_ALLOCATED);
        self.set_header(PROLOGUE, prologue);

        let epilogue = self.epilogue_offset();
        self.set_header(epilogue, Header::pack(0, 0, FLAG_ALLOCATED));

        let span = epilogue - FIRST_BLOCK;
        let free = Header::pack(span, 0, FLAG_PREV_ALLOCATED);
        self.set_header(FIRST_BLOCK, free);
        block::store_footer(&mut self.region, FIRST_BLOCK, free);
        self.free.insert(&mut self.region, FIRST_BLOCK);

        debug!(bytes = self.region.len(), "heap initialized");
        Ok(())
    }

    fn grow_region(&mut self) -> HeapResult<()> {
        match self.region.grow() {
            Some(_) => Ok(()),
            None => Err(HeapError::OutOfMemory {
                committed_pages: self.region.committed_pages(),
                max_pages: self.region.max_pages(),
            }),
        }
    }

    /// Extend the heap by one page: the old epilogue becomes a page-sized
    /// free block, coalesced backward, and a fresh epilogue is written.
    fn grow_one_page(&mut self) -> HeapResult<()> {
        let old_epilogue = self.epilogue_offset();
        let old = self.header(old_epilogue);
        self.grow_region()?;

        let reclaimed = Header::pack(PAGE_SIZE, 0, old.prev_allocated_flag());
        self.set_header(old_epilogue, reclaimed);
        block::store_footer(&mut self.region, old_epilogue, reclaimed);

        let epilogue = self.epilogue_offset();
        self.set_header(epilogue, Header::pack(0, 0, FLAG_ALLOCATED));

        self.coalesce_and_insert(old_epilogue);
        debug!(bytes = self.region.len(), "heap grown by one page");
        Ok(())
    }

    /// Carve `needed` bytes out of the free block at `b`, splitting when the
    /// remainder can stand alone, and return the payload pointer.
    fn place(&mut self, b: usize, needed: usize, payload: usize) -> NonNull<u8> {
        self.free.remove(&mut self.region, b);
        let header = self.header(b);
        let size = header.block_size();
        let remainder = size - needed;

        if remainder >= MIN_BLOCK_SIZE {
            let kept = Header::pack(needed, payload, FLAG_ALLOCATED | header.prev_allocated_flag());
            self.set_header(b, kept);
            let suffix = b + needed;
            let sh = Header::pack(remainder, 0, FLAG_PREV_ALLOCATED);
            self.set_header(suffix, sh);
            block::store_footer(&mut self.region, suffix, sh);
            self.coalesce_and_insert(suffix);
        } else {
            let whole = Header::pack(size, payload, FLAG_ALLOCATED | header.prev_allocated_flag());
            self.set_header(b, whole);
            block::store_footer(&mut self.region, b, whole);
            self.flag_next(b, size, FLAG_PREV_ALLOCATED, true);
        }

        self.credit_payload(payload);
        self.payload_ptr(b)
    }

    /// Merge the free block at `b` with any free neighbour, rewrite header
    /// and footer, fix the successor's prev-allocated bit, and insert the
    /// survivor into its size class.
    fn coalesce_and_insert(&mut self, b: usize) {
        let header = self.header(b);
        let mut start = b;
        let mut size = header.block_size();
        let mut prev_flag = header.prev_allocated_flag();

        if !header.is_prev_allocated() {
            let mirror = block::load_prev_footer(&self.region, b);
            let prev = b - mirror.block_size();
            self.free.remove(&mut self.region, prev);
            start = prev;
            size += mirror.block_size();
            prev_flag = mirror.prev_allocated_flag();
        }

        let next = start + size;
        let nh = self.header(next);
        if !nh.is_allocated() {
            self.free.remove(&mut self.region, next);
            size += nh.block_size();
        }

        let merged = Header::pack(size, 0, prev_flag);
        self.set_header(start, merged);
        block::store_footer(&mut self.region, start, merged);
        self.flag_next(start, size, FLAG_PREV_ALLOCATED, false);
        self.free.insert(&mut self.region, start);
    }

    /// Unpark every block of quick stack `index` and run each through the
    /// coalescer.
    fn flush_quick_list(&mut self, index: usize) {
        for b in self.quick.drain(&self.region, index) {
            let header = self.header(b);
            let freed = Header::pack(header.block_size(), 0, header.prev_allocated_flag());
            self.set_header(b, freed);
            block::store_footer(&mut self.region, b, freed);
            self.coalesce_and_insert(b);
        }
    }

    fn flag_next(&mut self, b: usize, size: usize, flag: u64, set: bool) {
        let next = b + size;
        let header = self.header(next);
        let updated = if set {
            header.with_flag(flag)
        } else {
            header.without_flag(flag)
        };
        self.set_header(next, updated);
    }

    fn credit_payload(&mut self, bytes: usize) {
        self.live_payload += bytes as u64;
        let live = self.live_payload as f64;
        if live > self.peak_payload {
            self.peak_payload = live;
        }
    }

    fn debit_payload(&mut self, bytes: usize) {
        self.live_payload = self.live_payload.saturating_sub(bytes as u64);
    }

    /// Validate a caller-supplied payload pointer, aborting the process on
    /// any violation, and return the owning block's struct offset.
    fn checked_block_of(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            self.abort_invalid(ptr, "null pointer");
        }
        if (ptr as usize) % block::ALIGNMENT != 0 {
            self.abort_invalid(ptr, "misaligned payload pointer");
        }
        let Some(payload_offset) = self.region.offset_of(ptr) else {
            self.abort_invalid(ptr, "pointer outside the heap");
        };
        if payload_offset < FIRST_BLOCK + PAYLOAD_OFFSET {
            self.abort_invalid(ptr, "pointer inside the prologue");
        }
        let b = payload_offset - PAYLOAD_OFFSET;
        let header = self.header(b);
        let size = header.block_size();
        if size < MIN_BLOCK_SIZE || size % block::ALIGNMENT != 0 {
            self.abort_invalid(ptr, "block size out of range");
        }
        if b + size > self.epilogue_offset() {
            self.abort_invalid(ptr, "block extends past the heap");
        }
        if !header.is_allocated() {
            self.abort_invalid(ptr, "block is not allocated");
        }
        if header.in_quick_list() {
            self.abort_invalid(ptr, "block is already parked in a quick list");
        }
        if !header.is_prev_allocated()
            && block::load_prev_footer(&self.region, b).is_allocated()
        {
            self.abort_invalid(ptr, "previous-block accounting disagrees");
        }
        b
    }

    fn abort_invalid(&self, ptr: *mut u8, reason: &str) -> ! {
        error!(?ptr, reason, "invalid pointer passed to the heap engine");
        std::process::abort();
    }

    fn blocks(&self) -> BlockWalk<'_> {
        BlockWalk {
            heap: self,
            offset: PROLOGUE,
            finished: self.region.len() == 0,
        }
    }
}

impl std::fmt::Debug for SegHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SegHeap")
            .field("config", &self.config)
            .field("committed_pages", &stats.committed_pages)
            .field("allocated_blocks", &stats.allocated_blocks)
            .field("free_blocks", &stats.free_blocks)
            .field("quick_cached", &stats.quick_cached)
            .field("live_payload", &stats.live_payload)
            .finish_non_exhaustive()
    }
}

/// In-order walk over every block, sentinels included; the epilogue (block
/// size 0) is the final item.
struct BlockWalk<'a> {
    heap: &'a SegHeap,
    offset: usize,
    finished: bool,
}

impl Iterator for BlockWalk<'_> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let offset = self.offset;
        let header = self.heap.header(offset);
        if header.block_size() == 0 || offset >= self.heap.epilogue_offset() {
            self.finished = true;
            return Some((offset, header));
        }
        self.offset = offset + header.block_size();
        Some((offset, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with_pages(pages: usize) -> SegHeap {
        SegHeap::with_config(HeapConfig::default().max_pages(pages)).unwrap()
    }

    #[test]
    fn empty_heap_reports_zeroes() {
        let heap = heap_with_pages(4);
        assert_eq!(heap.internal_fragmentation(), 0.0);
        assert_eq!(heap.peak_utilization(), 0.0);
        assert!(heap.check_consistency().is_ok());
        assert_eq!(heap.stats().committed_pages, 0);
    }

    #[test]
    fn first_alloc_commits_one_page() {
        let mut heap = heap_with_pages(4);
        let p = heap.alloc(100).unwrap();
        assert_eq!(p.as_ptr() as usize % block::ALIGNMENT, 0);
        assert_eq!(heap.stats().committed_pages, 1);
        heap.check_consistency().unwrap();
        unsafe { heap.free(p.as_ptr()) };
        heap.check_consistency().unwrap();
    }

    #[test]
    fn zero_and_oversize_requests() {
        let mut heap = heap_with_pages(4);
        assert!(matches!(heap.alloc(0), Err(HeapError::ZeroSize)));
        assert!(matches!(
            heap.alloc(usize::MAX),
            Err(HeapError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn region_exhaustion_is_oom() {
        let mut heap = heap_with_pages(1);
        // One page minus pad, prologue, and epilogue leaves 4048 block bytes.
        let p = heap.alloc(4000).unwrap();
        let err = heap.alloc(4000).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }));
        // The failed call must not have disturbed anything.
        heap.check_consistency().unwrap();
        unsafe { heap.free(p.as_ptr()) };
        heap.check_consistency().unwrap();
    }

    #[test]
    fn growth_spans_pages() {
        let mut heap = heap_with_pages(4);
        let p = heap.alloc(6000).unwrap();
        assert_eq!(heap.stats().committed_pages, 2);
        heap.check_consistency().unwrap();
        unsafe { heap.free(p.as_ptr()) };
        heap.check_consistency().unwrap();
    }

    #[test]
    fn peak_payload_monotone_and_utilization_bounded() {
        let mut heap = heap_with_pages(8);
        let mut last_peak = 0.0f64;
        let mut live = Vec::new();
        for i in 1..30 {
            live.push(heap.alloc(i * 24).unwrap());
            let peak = heap.stats().peak_payload;
            assert!(peak >= last_peak);
            last_peak = peak;
            let utilization = heap.peak_utilization();
            assert!((0.0..=1.0).contains(&utilization));
        }
        // Frees never move the peak, and the heap size is stable here, so
        // utilization holds steady while everything is released.
        let settled = heap.peak_utilization();
        for p in live {
            unsafe { heap.free(p.as_ptr()) };
            assert_eq!(heap.peak_utilization(), settled);
        }
        heap.check_consistency().unwrap();
    }
}
