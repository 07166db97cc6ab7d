//! Usage counters for the allocator and its page cache.

/// Running totals kept by [`VirtAlloc`](crate::VirtAlloc).
///
/// `mem_used` tracks the bytes currently claimed from the pool by live
/// allocations (headers included); the page and byte counters track
/// traffic to the backing store caused by page swaps and write-back.
/// All counters are cleared by `start()` and by
/// [`reset`](TraceStats::reset).
#[derive(Clone, Debug, Default)]
pub struct TraceStats {
    /// Bytes of the pool currently held by live allocations.
    pub mem_used: u64,
    /// High-water mark of `mem_used`.
    pub max_mem_used: u64,
    /// Number of big pages read in from the backing store.
    pub big_page_reads: u64,
    /// Number of big pages written back to the backing store.
    pub big_page_writes: u64,
    /// Bytes read from the backing store.
    pub bytes_read: u64,
    /// Bytes written to the backing store.
    pub bytes_written: u64,
}

impl TraceStats {
    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = TraceStats::default();
    }

    pub(crate) fn note_used(&mut self, bytes: u64) {
        self.mem_used += bytes;
        if self.mem_used > self.max_mem_used {
            self.max_mem_used = self.mem_used;
        }
    }
}
