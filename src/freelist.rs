//! The free-list allocator over the virtual pool.
//!
//! Free blocks carry a [`BlockHeader`] inline in the pool: the block size
//! in whole header units (header included) and the address of the next
//! free block. The list is circular and strictly sorted by address,
//! anchored by a RAM-resident header at the sentinel address
//! [`BASE_INDEX`]; `free_pointer` rotates through the list as the search
//! start so consecutive allocations don't rescan the same prefix.
//!
//! Headers are pool data like any other, so every header access goes
//! through the pager and can itself trigger page eviction. The anchor is
//! special-cased to the RAM copy, which is what terminates that cycle.

use log::debug;
use static_assertions::const_assert_eq;

use crate::backing::BackingStore;
use crate::{VAddr, VSize, VirtAlloc};

/// Bytes per header unit; the quantum of allocation.
pub(crate) const HEADER_SIZE: VSize = 8;

/// Sentinel address of the RAM-resident free-list anchor. Outside the
/// valid pool range, so it can never collide with a real block.
pub(crate) const BASE_INDEX: VAddr = VAddr::MAX;

/// Header of a free (or just-carved) block in the virtual pool.
///
/// `size` counts header units occupied by the block, including the
/// header itself. Stored little-endian: `next` first, then `size`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct BlockHeader {
    pub next: VAddr,
    pub size: VSize,
}

const_assert_eq!(HEADER_SIZE as usize, core::mem::size_of::<BlockHeader>());

impl BlockHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut bytes = [0u8; HEADER_SIZE as usize];
        bytes[..4].copy_from_slice(&self.next.to_le_bytes());
        bytes[4..].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> BlockHeader {
        BlockHeader {
            next: VAddr::from_le_bytes(bytes[..4].try_into().unwrap()),
            size: VSize::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Invalid states found while walking the free list.
///
/// All-zero means the list upholds its invariants.
#[derive(Debug, Default)]
pub struct Validity {
    /// Blocks overlapping other blocks. Indicates corruption.
    pub overlaps: usize,
    /// Blocks directly adjacent to their successor without having been
    /// merged. Not corrupt, but coalescing failed somewhere.
    pub adjacents: usize,
    /// Links that do not increase in address (outside the single
    /// anchor wrap-around). Indicates corruption.
    pub out_of_orders: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }
}

/// Size of the free list: node count and total bytes held.
#[derive(Debug, Default)]
pub struct FreeStats {
    pub length: usize,
    /// Bytes on the free list, headers included.
    pub size: VSize,
}

impl<B: BackingStore> VirtAlloc<B> {
    /// Read the header at `p`, resolving the anchor sentinel to RAM.
    pub(crate) fn header_at(&mut self, p: VAddr) -> Result<BlockHeader, B::Error> {
        if p == BASE_INDEX {
            return Ok(self.base_header);
        }
        let bytes = self.read(p, HEADER_SIZE)?;
        Ok(BlockHeader::from_bytes(bytes))
    }

    /// Write the header at `p`, resolving the anchor sentinel to RAM.
    pub(crate) fn update_header(&mut self, p: VAddr, h: BlockHeader) -> Result<(), B::Error> {
        if p == BASE_INDEX {
            self.base_header = h;
            Ok(())
        } else {
            self.write(p, &h.to_bytes())
        }
    }

    /// Allocate `size` bytes of raw virtual memory.
    ///
    /// Returns the starting address of the block, or `0` when the free
    /// list cannot satisfy the request and the pool cannot grow.
    pub fn alloc_raw(&mut self, size: VSize) -> Result<VAddr, B::Error> {
        assert!(size > 0, "zero-sized allocation");
        let quantity = (size + HEADER_SIZE - 1) / HEADER_SIZE + 1;
        let mut prevp = self.free_pointer;

        // First call: set up the anchor as a degenerate zero-sized
        // block pointing at itself.
        if prevp == 0 {
            self.base_header = BlockHeader {
                next: BASE_INDEX,
                size: 0,
            };
            self.free_pointer = BASE_INDEX;
            prevp = BASE_INDEX;
        }

        let mut p = self.header_at(prevp)?.next;
        loop {
            let mut h = self.header_at(p)?;

            if h.size >= quantity {
                self.stats.note_used((quantity * HEADER_SIZE) as u64);

                if h.size == quantity {
                    // Exact fit: unlink the block.
                    let next = h.next;
                    let mut prevh = self.header_at(prevp)?;
                    prevh.next = next;
                    self.update_header(prevp, prevh)?;
                } else {
                    // Too big: shrink in place and carve the tail off.
                    h.size -= quantity;
                    self.update_header(p, h)?;
                    p += h.size * HEADER_SIZE;
                    let mut tail = self.header_at(p)?;
                    tail.size = quantity;
                    self.update_header(p, tail)?;
                }

                self.free_pointer = prevp;
                debug!("alloc_raw({}) -> {} ({} units)", size, p + HEADER_SIZE, quantity);
                return Ok(p + HEADER_SIZE);
            }

            if p == self.free_pointer {
                // Walked the whole cycle without a fit; claim fresh pool
                // space. The new block is spliced into the free list and
                // found by the following iterations.
                p = self.grow_pool(quantity)?;
                if p == 0 {
                    debug!("alloc_raw({}): out of virtual memory", size);
                    return Ok(0);
                }
                h = self.header_at(p)?;
            }

            prevp = p;
            p = h.next;
            debug_assert!(p != 0);
        }
    }

    /// Claim at least `quantity` header units of never-used pool space
    /// and splice them into the free list. Returns the rotated
    /// `free_pointer` on success, `0` when the pool is exhausted.
    fn grow_pool(&mut self, quantity: VSize) -> Result<VAddr, B::Error> {
        let quantity = quantity.max(self.config.min_alloc_units);
        let total = quantity * HEADER_SIZE;

        if self.pool_free_pos as u64 + total as u64 > self.pool_size as u64 {
            return Ok(0);
        }

        let h = BlockHeader {
            next: 0,
            size: quantity,
        };
        self.update_header(self.pool_free_pos, h)?;
        // Counted as used here so the free_raw below balances out.
        self.stats.mem_used += total as u64;
        self.free_raw(self.pool_free_pos + HEADER_SIZE)?;
        self.pool_free_pos += total;

        Ok(self.free_pointer)
    }

    /// Return the block at `ptr` to the free list, coalescing with
    /// adjacent free neighbors. Does nothing when `ptr` is `0`.
    pub fn free_raw(&mut self, ptr: VAddr) -> Result<(), B::Error> {
        if ptr == 0 {
            return Ok(());
        }
        assert!(self.free_pointer != 0, "free_raw before any allocation");

        let hdrptr = ptr - HEADER_SIZE;
        let mut header = self.header_at(hdrptr)?;
        self.stats.mem_used -= (header.size * HEADER_SIZE) as u64;

        // Walk the circle for the insertion point: the node after which
        // `hdrptr` belongs in address order. The single node whose next
        // wraps around to a lower address is where out-of-range
        // addresses are inserted.
        let mut p = self.free_pointer;
        let mut ph = self.header_at(p)?;
        while !(hdrptr > p && hdrptr < ph.next) {
            if p >= ph.next && (hdrptr > p || hdrptr < ph.next) {
                break;
            }
            p = ph.next;
            ph = self.header_at(p)?;
        }

        // Coalesce with the higher neighbor.
        if hdrptr + header.size * HEADER_SIZE == ph.next {
            let nexth = self.header_at(ph.next)?;
            header.size += nexth.size;
            header.next = nexth.next;
        } else {
            header.next = ph.next;
        }
        self.update_header(hdrptr, header)?;

        // Coalesce with the lower neighbor.
        if p + ph.size * HEADER_SIZE == hdrptr {
            ph.size += header.size;
            ph.next = header.next;
        } else {
            ph.next = hdrptr;
        }
        self.update_header(p, ph)?;

        debug_assert!(ph.next != 0);
        self.free_pointer = p;
        debug!("free_raw({})", ptr);
        Ok(())
    }

    /// Walk the free list once, checking its invariants and summing its
    /// size. A fresh allocator (no allocations yet) reports an empty,
    /// valid list.
    pub fn free_list_stats(&mut self) -> Result<(Validity, FreeStats), B::Error> {
        let mut validity = Validity::default();
        let mut stats = FreeStats::default();

        if self.free_pointer == 0 {
            return Ok((validity, stats));
        }

        let mut prev_end: Option<VAddr> = None;
        let mut p = self.base_header.next;
        while p != BASE_INDEX {
            let h = self.header_at(p)?;
            stats.length += 1;
            stats.size += h.size * HEADER_SIZE;

            if let Some(end) = prev_end {
                if p < end {
                    validity.overlaps += 1;
                } else if p == end {
                    validity.adjacents += 1;
                }
            }
            if h.next != BASE_INDEX && h.next <= p {
                validity.out_of_orders += 1;
                break;
            }

            prev_end = Some(p + h.size * HEADER_SIZE);
            p = h.next;
        }

        Ok((validity, stats))
    }
}
