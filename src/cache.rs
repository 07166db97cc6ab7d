//! The big-class working set: demand paging of the virtual pool.
//!
//! Every raw access that is not covered by a lock goes through here. Big
//! frames on the free chain mirror recently touched regions of the pool;
//! victim selection prefers, in order, a frame already covering the
//! range, a partially overlapping frame (which must be written back and
//! invalidated anyway), an empty frame, a clean frame, and finally a
//! dirty frame picked round-robin so write-backs rotate fairly. A dirty
//! frame that dodges eviction too often (`max_clean_skips`) is treated
//! as clean.

use core::mem;

use log::trace;

use crate::backing::BackingStore;
use crate::pages::{BIG, NIL};
use crate::{VAddr, VSize, VirtAlloc};

/// Outcome tiers of the victim scan, best first.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Found {
    Full,
    Partial,
    Empty,
    Clean,
    Dirty,
    Nothing,
}

impl<B: BackingStore> VirtAlloc<B> {
    /// Write a big frame back to the store if it is dirty.
    pub(crate) fn sync_big_page(&mut self, fi: usize) -> Result<(), B::Error> {
        debug_assert!(self.classes[BIG].frames[fi].start != 0);

        if self.classes[BIG].frames[fi].dirty {
            let start = self.classes[BIG].frames[fi].start;
            let wrsize = (self.pool_size - start).min(self.classes[BIG].frame_size as VSize);
            self.store
                .write(start, &self.classes[BIG].frames[fi].pool[..wrsize as usize])?;
            let f = &mut self.classes[BIG].frames[fi];
            f.dirty = false;
            f.clean_skips = 0;
            self.stats.big_page_writes += 1;
            self.stats.bytes_written += wrsize as u64;
        }
        Ok(())
    }

    /// Fill `dest` from virtual address `p`, honoring resident big
    /// frames: overlapping working-set frames contribute from RAM, the
    /// remainder comes from the store. A frame can overlap the start or
    /// the end of the range, never both.
    pub(crate) fn copy_raw_data(&mut self, dest: &mut [u8], p: VAddr) -> Result<(), B::Error> {
        let big_size = self.classes[BIG].frame_size as VAddr;
        let mut p = p;
        let mut off = 0usize;
        let mut size = dest.len() as VSize;

        let mut i = self.classes[BIG].free_head;
        while i != NIL && size > 0 {
            let fi = i as usize;
            let next = self.classes[BIG].frames[fi].next;
            let f = &self.classes[BIG].frames[fi];
            if f.start == 0 {
                i = next;
                continue;
            }

            let page_end = f.start + big_size;
            if p >= f.start && p < page_end {
                // Range starts inside this frame.
                let foff = (p - f.start) as usize;
                let copysize = size.min(f.size as VSize - (p - f.start)) as usize;
                dest[off..off + copysize].copy_from_slice(&f.pool[foff..foff + copysize]);
                off += copysize;
                p += copysize as VAddr;
                size -= copysize as VSize;
            } else if p < f.start && p + size > f.start {
                // Range ends inside this frame.
                let doff = (f.start - p) as VSize;
                let copysize = (size - doff).min(f.size as VSize) as usize;
                let doff = doff as usize;
                dest[off + doff..off + doff + copysize].copy_from_slice(&f.pool[..copysize]);
                size = doff as VSize;
            }
            i = next;
        }

        if size > 0 {
            self.store.read(p, &mut dest[off..off + size as usize])?;
            self.stats.bytes_read += size as u64;
        }
        Ok(())
    }

    /// Store `src` at virtual address `p`; the reverse of
    /// [`copy_raw_data`](Self::copy_raw_data). Resident frames take the
    /// overlapping bytes in RAM and only turn dirty when the bytes
    /// actually change.
    pub(crate) fn save_raw_data(&mut self, src: &[u8], p: VAddr) -> Result<(), B::Error> {
        let big_size = self.classes[BIG].frame_size as VAddr;
        let mut p = p;
        let mut off = 0usize;
        let mut size = src.len() as VSize;

        let mut i = self.classes[BIG].free_head;
        while i != NIL && size > 0 {
            let fi = i as usize;
            let next = self.classes[BIG].frames[fi].next;
            let f = &mut self.classes[BIG].frames[fi];
            if f.start == 0 {
                i = next;
                continue;
            }

            let page_end = f.start + big_size;
            if p >= f.start && p < page_end {
                let foff = (p - f.start) as usize;
                let copysize = size.min(f.size as VSize - (p - f.start)) as usize;
                let chunk = &src[off..off + copysize];
                if f.dirty || &f.pool[foff..foff + copysize] != chunk {
                    f.pool[foff..foff + copysize].copy_from_slice(chunk);
                    f.dirty = true;
                }
                off += copysize;
                p += copysize as VAddr;
                size -= copysize as VSize;
            } else if p < f.start && p + size > f.start {
                let doff = (f.start - p) as VSize;
                let copysize = (size - doff).min(f.size as VSize) as usize;
                let doff = doff as usize;
                let chunk = &src[off + doff..off + doff + copysize];
                if f.dirty || &f.pool[..copysize] != chunk {
                    f.pool[..copysize].copy_from_slice(chunk);
                    f.dirty = true;
                }
                size = doff as VSize;
            }
            i = next;
        }

        if size > 0 {
            self.store.write(p, &src[off..off + size as usize])?;
            self.stats.bytes_written += size as u64;
        }
        Ok(())
    }

    /// Make `[p, p + size)` resident in a big working-set frame and
    /// return the frame's index. The frame then satisfies
    /// `start <= p` and `start + size >= p + size`; with `force_start`
    /// the frame starts exactly at `p`.
    pub(crate) fn pull_big(
        &mut self,
        p: VAddr,
        size: VSize,
        readonly: bool,
        force_start: bool,
    ) -> Result<usize, B::Error> {
        assert!(p != 0 && p < self.pool_size, "pull outside the pool: {}", p);
        assert!(
            size <= self.classes[BIG].frame_size as VSize,
            "request larger than a big frame: {}",
            size
        );

        let big_size = self.classes[BIG].frame_size as VAddr;
        let mut page: i16 = self.classes[BIG].find_covering(p, size, force_start);
        let mut state = if page != NIL { Found::Full } else { Found::Nothing };

        if state != Found::Full {
            let new_page_end = p + big_size;

            let mut i = self.classes[BIG].free_head;
            while i != NIL {
                let fi = i as usize;
                let next = self.classes[BIG].frames[fi].next;
                let fstart = self.classes[BIG].frames[fi].start;

                if fstart != 0 {
                    let page_end = fstart + big_size;
                    if (p >= fstart && p < page_end)
                        || (new_page_end >= fstart && new_page_end <= page_end)
                    {
                        // Overlaps the range the victim will mirror: it
                        // has to be cleared out no matter what.
                        page = i;
                        self.sync_big_page(fi)?;
                        self.classes[BIG].frames[fi].start = 0;
                        state = Found::Partial;
                    }
                } else if state != Found::Partial {
                    page = i;
                    state = Found::Empty;
                }

                if state > Found::Clean {
                    let max_skips = self.config.max_clean_skips;
                    let f = &mut self.classes[BIG].frames[fi];
                    let reusable = if f.dirty {
                        f.clean_skips += 1;
                        f.clean_skips >= max_skips
                    } else {
                        true
                    };
                    if reusable {
                        page = i;
                        state = Found::Clean;
                    } else if state != Found::Dirty && i == self.next_page_to_swap {
                        page = i;
                        state = Found::Dirty;
                    }
                }

                i = next;
            }
        }

        assert!(page != NIL, "no big frame available in the working set");
        let fi = page as usize;

        if state != Found::Full {
            trace!(
                "page swap: frame {} {:?} -> [{}, {})",
                fi,
                state,
                p,
                p + size
            );

            if self.classes[BIG].frames[fi].start != 0 {
                self.sync_big_page(fi)?;
            }

            if state == Found::Dirty {
                // Victimized the rotation cursor: advance it so dirty
                // frames are reused first-in first-out.
                self.next_page_to_swap = self.classes[BIG].frames[fi].next;
                if self.next_page_to_swap == NIL {
                    self.next_page_to_swap = self.classes[BIG].free_head;
                }
            } else {
                self.next_page_to_swap = self.classes[BIG].free_head;
            }

            self.classes[BIG].frames[fi].start = p;
            let rdsize = (self.pool_size - p).min(big_size as VSize);
            self.store
                .read(p, &mut self.classes[BIG].frames[fi].pool[..rdsize as usize])?;
            self.stats.big_page_reads += 1;
            self.stats.bytes_read += rdsize as u64;
        }

        if !readonly {
            self.classes[BIG].frames[fi].dirty = true;
        }

        debug_assert!(p >= self.classes[BIG].frames[fi].start);
        Ok(fi)
    }

    /// Copy `data` into the working set at `p`, paging as needed.
    pub(crate) fn push_raw_data(&mut self, p: VAddr, data: &[u8]) -> Result<(), B::Error> {
        let fi = self.pull_big(p, data.len() as VSize, false, false)?;
        let f = &mut self.classes[BIG].frames[fi];
        let offset = (p - f.start) as usize;
        f.pool[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Write every dirty big working-set frame back to the store.
    ///
    /// Locked pages are not touched.
    pub fn flush(&mut self) -> Result<(), B::Error> {
        let mut i = self.classes[BIG].free_head;
        while i != NIL {
            let fi = i as usize;
            let next = self.classes[BIG].frames[fi].next;
            if self.classes[BIG].frames[fi].start != 0 {
                self.sync_big_page(fi)?;
            }
            i = next;
        }
        Ok(())
    }

    /// [`flush`](Self::flush), then forget what every big working-set
    /// frame mirrors.
    pub fn clear_pages(&mut self) -> Result<(), B::Error> {
        let mut i = self.classes[BIG].free_head;
        while i != NIL {
            let fi = i as usize;
            let next = self.classes[BIG].frames[fi].next;
            if self.classes[BIG].frames[fi].start != 0 {
                self.sync_big_page(fi)?;
                self.classes[BIG].frames[fi].start = 0;
            }
            i = next;
        }
        Ok(())
    }

    /// Write `n` zero bytes at `start`, straight to the store.
    ///
    /// Meant for initializing pool regions right after
    /// [`start`](Self::start), before any page mirrors them; the first
    /// big frame is used as the zero buffer and must be empty.
    pub fn write_zeros(&mut self, start: VAddr, n: VSize) -> Result<(), B::Error> {
        assert!(
            self.classes[BIG].frames[0].start == 0,
            "write_zeros needs an empty working set"
        );

        let big_size = self.classes[BIG].frame_size as VSize;
        let mut zeros = mem::take(&mut self.classes[BIG].frames[0].pool);
        zeros.fill(0);

        let mut i = 0;
        let mut res = Ok(());
        while i < n {
            let chunk = (n - i).min(big_size);
            res = self.store.write(start + i, &zeros[..chunk as usize]);
            if res.is_err() {
                break;
            }
            i += chunk;
        }
        self.classes[BIG].frames[0].pool = zeros;
        res
    }
}
