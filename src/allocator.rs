//! The allocator object: configuration, lifecycle and raw byte I/O.

use core::mem;

use log::debug;

use crate::backing::BackingStore;
use crate::freelist::{BlockHeader, HEADER_SIZE};
use crate::pages::{PageClass, PageSet, BIG, NIL};
use crate::stats::TraceStats;
use crate::{FrameSize, VAddr, VSize};

/// Frame size and frame count of one page class.
#[derive(Clone, Copy, Debug)]
pub struct PageGeometry {
    pub frame_size: FrameSize,
    pub frame_count: u8,
}

impl PageGeometry {
    pub const fn new(frame_size: FrameSize, frame_count: u8) -> PageGeometry {
        PageGeometry {
            frame_size,
            frame_count,
        }
    }
}

/// Construction-time configuration of a [`VirtAlloc`].
///
/// The pool size itself comes from the backing store
/// ([`BackingStore::capacity`]); this struct only describes the RAM side:
/// the three page-class geometries and the paging tunables.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub small: PageGeometry,
    pub medium: PageGeometry,
    pub big: PageGeometry,
    /// Times a dirty frame may dodge eviction before it is treated as
    /// clean anyway.
    pub max_clean_skips: u8,
    /// Minimum pool growth, in header units.
    pub min_alloc_units: VSize,
    /// Reserved prefix of the pool. Keeps address 0 unused so it can
    /// mean "null".
    pub start_offset: VAddr,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            small: PageGeometry::new(64, 4),
            medium: PageGeometry::new(256, 4),
            big: PageGeometry::new(1024, 4),
            max_clean_skips: 5,
            min_alloc_units: 16,
            start_offset: 16,
        }
    }
}

/// A virtual memory allocator over a [`BackingStore`].
///
/// One instance owns every piece of state: the three page classes, the
/// RAM anchor of the free list and the trace counters. Construct it with
/// [`new`](VirtAlloc::new), call [`start`](VirtAlloc::start) before first
/// use, and treat it as strictly single-threaded.
pub struct VirtAlloc<B: BackingStore> {
    pub(crate) store: B,
    pub(crate) config: PoolConfig,
    pub(crate) pool_size: VSize,
    pub(crate) classes: [PageSet; 3],
    /// RAM-resident anchor of the circular free list. Lives at the
    /// sentinel address [`BASE_INDEX`](crate::freelist::BASE_INDEX) and is
    /// never written to the backing store.
    pub(crate) base_header: BlockHeader,
    /// Rotating search start of the circular free list; `0` until the
    /// first allocation initializes the list.
    pub(crate) free_pointer: VAddr,
    /// First never-claimed pool address; grows under allocation pressure.
    pub(crate) pool_free_pos: VAddr,
    /// Round-robin cursor for victimizing dirty big frames.
    pub(crate) next_page_to_swap: i16,
    pub(crate) stats: TraceStats,
}

impl<B: BackingStore> VirtAlloc<B> {
    /// Create an allocator over `store` with the given page geometry.
    ///
    /// # Panics
    ///
    /// Panics if the geometry is unusable: no big frames, class sizes
    /// not ordered small <= medium <= big, or a pool too small to hold
    /// the reserved prefix.
    pub fn new(store: B, config: PoolConfig) -> VirtAlloc<B> {
        let pool_size = store.capacity();
        assert!(config.big.frame_count >= 1, "need at least one big frame");
        assert!(
            config.small.frame_size <= config.medium.frame_size
                && config.medium.frame_size <= config.big.frame_size,
            "page classes must be ordered by frame size"
        );
        assert!(config.small.frame_size as VSize >= HEADER_SIZE);
        assert!(config.start_offset > 0, "address 0 is reserved");
        assert!(
            pool_size as u64 > config.start_offset as u64 + HEADER_SIZE as u64,
            "pool smaller than its reserved prefix"
        );

        VirtAlloc {
            store,
            config,
            pool_size,
            classes: [
                PageSet::new(config.small.frame_size, config.small.frame_count),
                PageSet::new(config.medium.frame_size, config.medium.frame_count),
                PageSet::new(config.big.frame_size, config.big.frame_count),
            ],
            base_header: BlockHeader::default(),
            free_pointer: 0,
            pool_free_pos: 0,
            next_page_to_swap: 0,
            stats: TraceStats::default(),
        }
    }

    /// Initialize the allocator and bring up the backing store.
    ///
    /// Must be called before any other operation, and again after
    /// [`stop`](VirtAlloc::stop) to reuse the allocator. All previously
    /// allocated virtual memory is invalidated.
    pub fn start(&mut self) -> Result<(), B::Error> {
        self.free_pointer = 0;
        self.next_page_to_swap = 0;
        self.base_header = BlockHeader::default();
        self.pool_free_pos = self.config.start_offset + HEADER_SIZE;
        self.stats.reset();
        for (ci, set) in self.classes.iter_mut().enumerate() {
            set.reset(ci == BIG);
        }
        self.store.start()
    }

    /// Release the backing store. The pool contents are not guaranteed
    /// to survive; restart with [`start`](VirtAlloc::start).
    pub fn stop(&mut self) -> Result<(), B::Error> {
        self.store.stop()
    }

    /// Read `size` bytes at virtual address `p`.
    ///
    /// The returned slice points into a page frame and is only valid
    /// until the next allocator call, which the borrow checker enforces.
    /// `size` must fit in a big frame.
    pub fn read(&mut self, p: VAddr, size: VSize) -> Result<&[u8], B::Error> {
        let pend = p + size;

        // A locked frame is authoritative for its range: serve from it
        // when it covers the whole request, and mirror it into the
        // working set first when it only covers part.
        for ci in 0..3 {
            let mut i = self.classes[ci].locked_head;
            while i != NIL {
                let fi = i as usize;
                let (fstart, fsize, next) = {
                    let f = &self.classes[ci].frames[fi];
                    (f.start, f.size, f.next)
                };
                let begin_overlaps = p >= fstart && p < fstart + fsize as VAddr;
                let end_overlaps = p < fstart && pend > fstart;

                if begin_overlaps {
                    let offset = (p - fstart) as usize;
                    if offset as u64 + size as u64 <= fsize as u64 {
                        return Ok(&self.classes[ci].frames[fi].pool[offset..offset + size as usize]);
                    }
                }

                if begin_overlaps || end_overlaps {
                    // Only fits partially: mirror the lock's bytes into
                    // the working set so a continuous block can be
                    // returned below.
                    let pool = mem::take(&mut self.classes[ci].frames[fi].pool);
                    let res = self.push_raw_data(fstart, &pool[..fsize as usize]);
                    self.classes[ci].frames[fi].pool = pool;
                    res?;
                }

                i = next;
            }
        }

        // Not in a lock, or too big for one: regular paged memory.
        let fi = self.pull_big(p, size, true, false)?;
        let f = &self.classes[BIG].frames[fi];
        let offset = (p - f.start) as usize;
        Ok(&f.pool[offset..offset + size as usize])
    }

    /// Write `data` at virtual address `p`.
    ///
    /// `data` must fit in a big frame.
    pub fn write(&mut self, p: VAddr, data: &[u8]) -> Result<(), B::Error> {
        let size = data.len() as VSize;
        let pend = p + size;

        for ci in 0..3 {
            let mut i = self.classes[ci].locked_head;
            while i != NIL {
                let fi = i as usize;
                let next = self.classes[ci].frames[fi].next;
                let f = &mut self.classes[ci].frames[fi];
                let begin_overlaps = p >= f.start && p < f.start + f.size as VAddr;
                let end_overlaps = p < f.start && pend > f.start;

                if !f.dirty && (begin_overlaps || end_overlaps) {
                    f.dirty = true;
                }

                if begin_overlaps {
                    let offset = (p - f.start) as usize;
                    if offset as u64 + size as u64 <= f.size as u64 {
                        f.pool[offset..offset + size as usize].copy_from_slice(data);
                        return Ok(());
                    }
                    // Data too large: copy the slice that fits.
                    let fits = f.size as usize - offset;
                    f.pool[offset..offset + fits].copy_from_slice(&data[..fits]);
                } else if end_overlaps {
                    // Data starts before the lock: copy the slice that fits.
                    let offset = (f.start - p) as usize;
                    let fits = (f.size as usize).min(data.len() - offset);
                    f.pool[..fits].copy_from_slice(&data[offset..offset + fits]);
                }

                i = next;
            }
        }

        // Not, or only partially, covered by locks. The partial slices
        // above get written a second time here, idempotently.
        self.push_raw_data(p, data)
    }

    /// Number of big frames neither mirroring data nor locked.
    pub fn free_big_pages(&self) -> u8 {
        self.classes[BIG].empty_free_count()
    }

    /// Number of frames in `class` that could host new data.
    pub fn unlocked_pages(&self, class: PageClass) -> u8 {
        self.classes[class.index()].unlocked_count()
    }

    /// Total number of frames in `class`.
    pub fn page_count(&self, class: PageClass) -> u8 {
        self.classes[class.index()].count()
    }

    /// Frame size of `class`, in bytes.
    pub fn page_size(&self, class: PageClass) -> FrameSize {
        self.classes[class.index()].frame_size
    }

    /// Size of the virtual pool, in bytes.
    ///
    /// Some of it is used for bookkeeping, so this is more than the
    /// total amount that can be allocated.
    pub fn pool_size(&self) -> VSize {
        self.pool_size
    }

    /// Usage counters.
    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    /// Zero all usage counters.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Borrow the backing store.
    pub fn store(&self) -> &B {
        &self.store
    }
}

impl<B: BackingStore> VirtAlloc<B> {
    /// Debug dump of the pool layout and the free list.
    pub fn log_pool_state(&mut self) -> Result<(), B::Error> {
        debug!(
            "pool: free_pos = {} ({} bytes left)",
            self.pool_free_pos,
            self.pool_size - self.pool_free_pos
        );

        if self.free_pointer == 0 {
            debug!("free list: empty");
            return Ok(());
        }
        let mut p = self.free_pointer;
        loop {
            let h = self.header_at(p)?;
            debug!("  * addr: {:>8}; size: {:>8}; next: {:>8}", p, h.size, h.next);
            p = h.next;
            if p == self.free_pointer {
                break;
            }
        }
        Ok(())
    }
}
