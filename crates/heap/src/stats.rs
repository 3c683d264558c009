//! Point-in-time heap statistics.

/// Snapshot of the heap's occupancy, produced by
/// [`SegHeap::stats`](crate::SegHeap::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeapStats {
    /// Pages committed so far.
    pub committed_pages: usize,
    /// Bytes committed so far.
    pub committed_bytes: usize,
    /// Live allocated blocks (quick-list blocks excluded).
    pub allocated_blocks: usize,
    /// Blocks on the segregated free lists.
    pub free_blocks: usize,
    /// Blocks parked in quick lists.
    pub quick_cached: usize,
    /// Current sum of payload bytes over allocated, non-quick-list blocks.
    pub live_payload: u64,
    /// Highest `live_payload` observed so far.
    pub peak_payload: f64,
}
