//! Lock management: pinning virtual ranges into frames.
//!
//! A lock pins `[ptr, ptr + size)` into a frame of one of the three
//! classes and hands out a host pointer that stays valid until the
//! matching [`release_lock`](crate::VirtAlloc::release_lock). Locked
//! frames are authoritative for their range: raw reads and writes
//! consult them first, and the working set is reconciled against them
//! before it serves overlapping requests.
//!
//! Two flavors exist. [`make_data_lock`](crate::VirtAlloc::make_data_lock)
//! is size-driven and may shrink existing locks out of the way, so a
//! caller always gets a frame starting exactly at `ptr`.
//! [`make_fitting_lock`](crate::VirtAlloc::make_fitting_lock) never
//! resizes existing locks; it shrinks the request instead and may return
//! a pointer into the middle of an existing frame.

use core::mem;
use core::ptr::NonNull;

use log::debug;

use crate::backing::BackingStore;
use crate::pages::{BIG, MEDIUM, NIL, SMALL};
use crate::{FrameSize, VAddr, VSize, VirtAlloc};

impl<B: BackingStore> VirtAlloc<B> {
    /// Write a locked frame's bytes out if it is dirty.
    ///
    /// Goes through the raw-save path so resident working-set frames
    /// pick the bytes up in RAM.
    pub(crate) fn sync_locked_page(&mut self, ci: usize, fi: usize) -> Result<(), B::Error> {
        debug_assert!(self.classes[ci].frames[fi].start != 0);

        if self.classes[ci].frames[fi].dirty {
            let start = self.classes[ci].frames[fi].start;
            let fsize = self.classes[ci].frames[fi].size;
            let pool = mem::take(&mut self.classes[ci].frames[fi].pool);
            let res = self.save_raw_data(&pool[..fsize as usize], start);
            self.classes[ci].frames[fi].pool = pool;
            res?;
        }
        Ok(())
    }

    /// Move a frame from the free chain to the locked chain, populating
    /// big frames through the pager. Returns the frame index.
    ///
    /// The caller must make sure the class has a free frame (for big,
    /// an unpinned frame the pull can claim).
    pub(crate) fn lock_page(
        &mut self,
        ci: usize,
        ptr: VAddr,
        size: FrameSize,
    ) -> Result<i16, B::Error> {
        let index;
        if ci == BIG {
            // Read the data in readonly; the caller applies the real
            // readonly state afterwards.
            self.pull_big(ptr, size as VSize, true, true)?;
            index = self.classes[BIG].find_covering(ptr, size as VSize, true);
            debug_assert!(index != NIL);
            if size < self.classes[BIG].frame_size {
                // Data outside the lock range lives only here; make the
                // store current before the frame shrinks around the lock.
                self.sync_big_page(index as usize)?;
            }
        } else {
            index = self.classes[ci].free_head;
        }

        self.classes[ci].unlink_free(index);
        if ci == BIG && self.next_page_to_swap == index {
            self.next_page_to_swap = self.classes[BIG].free_head;
        }
        self.classes[ci].push_locked(index);
        Ok(index)
    }

    /// Return a locked-chain frame to the free chain. Returns the index
    /// that followed it on the locked chain, so chain walks can continue
    /// after removing a frame mid-iteration.
    pub(crate) fn free_locked_page(&mut self, ci: usize, index: i16) -> Result<i16, B::Error> {
        let fi = index as usize;

        if ci != BIG {
            self.sync_locked_page(ci, fi)?;
        } else if self.classes[BIG].frames[fi].size < self.classes[BIG].frame_size {
            // Shrunk big frames cannot serve regular paging; write them
            // out and restore them to full-size empties.
            self.sync_locked_page(ci, fi)?;
            let frame_size = self.classes[BIG].frame_size;
            let f = &mut self.classes[BIG].frames[fi];
            f.start = 0;
            f.size = frame_size;
        }

        let ret = self.classes[ci].frames[fi].next;
        self.classes[ci].unlink_locked(index);
        self.classes[ci].push_free(index);
        if ci == BIG && self.next_page_to_swap == NIL {
            self.next_page_to_swap = self.classes[BIG].free_head;
        }
        self.classes[ci].frames[fi].locks = 0;
        Ok(ret)
    }

    /// Pin `[ptr, ptr + size)` into a frame starting exactly at `ptr`
    /// and return a pointer to the frame's buffer.
    ///
    /// The class is chosen by size; an existing lock at `ptr` is reused
    /// (shrinking it, or the request, as needed), and existing locks
    /// overlapping the range are shrunk out of the way. Returns `None`
    /// when every candidate frame is pinned.
    ///
    /// The pointer stays valid until the matching
    /// [`release_lock`](Self::release_lock). A later data lock on an
    /// overlapping range may shrink this frame and cut off the tail of
    /// the pointed-to range.
    pub fn make_data_lock(
        &mut self,
        ptr: VAddr,
        size: FrameSize,
        readonly: bool,
    ) -> Result<Option<NonNull<u8>>, B::Error> {
        assert!(ptr != 0, "locking the null address");
        assert!(
            size <= self.classes[BIG].frame_size,
            "lock larger than a big frame"
        );

        let mut size = size;
        let mut ci = if size <= self.classes[SMALL].frame_size {
            SMALL
        } else if size <= self.classes[MEDIUM].frame_size {
            MEDIUM
        } else {
            BIG
        };

        let mut page: i16 = NIL;
        let mut old_lock: i16 = NIL;
        let mut sec_old_lock: i16 = NIL;
        let mut sec_ci: usize = 0;
        let mut fix_begin = false;
        let mut shrunk = false;

        'scan: for pj in 0..3 {
            let mut i = self.classes[pj].locked_head;
            while i != NIL {
                let fi = i as usize;
                let (fstart, fsize, flocks, fnext) = {
                    let f = &self.classes[pj].frames[fi];
                    (f.start, f.size, f.locks, f.next)
                };

                if fstart == ptr {
                    if ci != pj {
                        if flocks == 0 {
                            // A stale lock of the wrong size class;
                            // remove it and keep scanning.
                            i = self.free_locked_page(pj, i)?;
                            continue;
                        }
                        // Still pinned in another, presumably larger,
                        // class: adopt that frame. It may be smaller
                        // than asked if the lock was resized before.
                        if self.classes[pj].frame_size < self.classes[ci].frame_size {
                            size = size.min(self.classes[pj].frame_size);
                        }
                        ci = pj;
                    } else if fsize > size {
                        debug_assert!(flocks == 0);
                        // Requested less than the frame holds: write the
                        // excess out and shrink the frame.
                        let pool = mem::take(&mut self.classes[pj].frames[fi].pool);
                        let res = self.save_raw_data(
                            &pool[size as usize..fsize as usize],
                            ptr + size as VAddr,
                        );
                        self.classes[pj].frames[fi].pool = pool;
                        res?;
                        self.classes[pj].frames[fi].size = size;
                    }

                    page = i;
                    if self.classes[pj].frames[fi].size == size {
                        // No overlap possible anymore; stop searching.
                        break 'scan;
                    }
                } else {
                    let end_overlaps = ptr < fstart && ptr + size as VAddr > fstart;
                    let begin_overlaps = ptr > fstart && ptr < fstart + fsize as VAddr;

                    if flocks > 0 {
                        if end_overlaps {
                            // Shrink the request so it stops short of
                            // the pinned lock.
                            size = (fstart - ptr) as FrameSize;
                            shrunk = true;
                        } else if begin_overlaps {
                            fix_begin = true;
                        }
                    } else {
                        if end_overlaps || begin_overlaps {
                            // Unpinned and in the way; it may never be
                            // used again, so out it goes.
                            i = self.free_locked_page(pj, i)?;
                            continue;
                        }
                        if old_lock == NIL {
                            if ci == pj {
                                old_lock = i;
                            } else if sec_old_lock == NIL
                                && self.classes[ci].frame_size < self.classes[pj].frame_size
                            {
                                // Remember bigger frames in case the
                                // preferred class has nothing.
                                sec_old_lock = i;
                                sec_ci = pj;
                            }
                        }
                    }
                }

                i = fnext;
            }
        }

        // If the request shrank below medium size, try to move it out of
        // the big class; big frames are relatively precious.
        if shrunk
            && size <= self.classes[MEDIUM].frame_size
            && ci == BIG
            && (page == NIL || self.classes[BIG].frames[page as usize].locks == 0)
        {
            let old_ci = ci;

            if size <= self.classes[SMALL].frame_size {
                if self.classes[SMALL].free_head != NIL {
                    ci = SMALL;
                } else {
                    let idx = self.classes[SMALL].find_unused_locked();
                    if idx != NIL {
                        ci = SMALL;
                        old_lock = idx;
                    }
                }
            }

            if ci == old_ci {
                if self.classes[MEDIUM].free_head != NIL {
                    ci = MEDIUM;
                } else {
                    let idx = self.classes[MEDIUM].find_unused_locked();
                    if idx != NIL {
                        ci = MEDIUM;
                        old_lock = idx;
                    }
                }
            }

            if ci != old_ci && page != NIL {
                self.free_locked_page(old_ci, page)?;
                page = NIL;
            }
        }

        if page == NIL {
            // Nothing matched `ptr`; materialize a new lock. If the
            // chosen class is out of frames, a bigger class will do.
            if self.classes[ci].free_head == NIL && old_lock == NIL {
                if self.classes[ci].frame_size < self.classes[MEDIUM].frame_size
                    && self.classes[MEDIUM].free_head != NIL
                {
                    ci = MEDIUM;
                } else if self.classes[ci].frame_size < self.classes[BIG].frame_size
                    && self.classes[BIG].free_head != NIL
                {
                    ci = BIG;
                }
            }

            let mut copy_offset: FrameSize = 0;

            if self.classes[ci].free_head != NIL {
                if ci == BIG {
                    // Big frames are already populated by the pull in
                    // lock_page.
                    copy_offset = size;
                }
                page = self.lock_page(ci, ptr, size)?;
            } else {
                if old_lock == NIL && sec_old_lock != NIL {
                    ci = sec_ci;
                    old_lock = sec_old_lock;
                }
                if old_lock != NIL {
                    self.sync_locked_page(ci, old_lock as usize)?;
                    self.classes[ci].frames[old_lock as usize].dirty = false;
                    page = old_lock;
                } else {
                    debug!("no frame available to lock {} + {}", ptr, size);
                    return Ok(None);
                }
            }

            if fix_begin {
                // A pinned lock overlapping the beginning holds the
                // freshest bytes for its range. Copy the overlap out of
                // it, then shrink it so this lock fits. Couldn't be done
                // during the scan: the receiving frame wasn't known yet.
                for pj in 0..3 {
                    let mut i = self.classes[pj].locked_head;
                    while i != NIL {
                        let fi = i as usize;
                        let (fstart, fsize, fnext) = {
                            let f = &self.classes[pj].frames[fi];
                            (f.start, f.size, f.next)
                        };
                        if (i != page || pj != ci)
                            && ptr > fstart
                            && ptr < fstart + fsize as VAddr
                        {
                            let off_old = (ptr - fstart) as usize;
                            let copysize =
                                ((fsize as usize - off_old) as FrameSize).min(size);
                            let mut dst =
                                mem::take(&mut self.classes[ci].frames[page as usize].pool);
                            dst[..copysize as usize].copy_from_slice(
                                &self.classes[pj].frames[fi].pool
                                    [off_old..off_old + copysize as usize],
                            );
                            self.classes[ci].frames[page as usize].pool = dst;
                            copy_offset = copy_offset.max(copysize);
                            self.classes[pj].frames[fi].size = off_old as FrameSize;
                        }
                        i = fnext;
                    }
                }
            }

            if copy_offset < size {
                // Fetch whatever the overlap reconciliation didn't cover.
                let mut dst = mem::take(&mut self.classes[ci].frames[page as usize].pool);
                let res = self.copy_raw_data(
                    &mut dst[copy_offset as usize..size as usize],
                    ptr + copy_offset as VAddr,
                );
                self.classes[ci].frames[page as usize].pool = dst;
                res?;
            }

            self.classes[ci].frames[page as usize].start = ptr;
        } else {
            let fsize = self.classes[ci].frames[page as usize].size;
            if size > fsize {
                // The lock grew back, either because it previously held
                // a smaller range or because an overlap disappeared.
                let mut dst = mem::take(&mut self.classes[ci].frames[page as usize].pool);
                let res = self.copy_raw_data(
                    &mut dst[fsize as usize..size as usize],
                    ptr + fsize as VAddr,
                );
                self.classes[ci].frames[page as usize].pool = dst;
                res?;
            }
        }

        let f = &mut self.classes[ci].frames[page as usize];
        if !f.dirty {
            f.dirty = !readonly;
        }
        f.locks += 1;
        f.size = size;
        debug!("data lock {} + {} in class {} frame {}", ptr, size, ci, page);
        Ok(Some(NonNull::new(f.pool.as_mut_ptr()).unwrap()))
    }

    /// Pin a range starting at `ptr` without resizing any existing lock.
    ///
    /// If `ptr` falls inside an existing lock, that lock is reused and
    /// the returned pointer points into its frame. Otherwise a new lock
    /// is created, shrunk as needed to avoid every pinned lock in the
    /// way. `size` is in-out: it enters as the desired length and leaves
    /// as the length actually behind the returned pointer. Returns
    /// `None` when every candidate frame is pinned.
    pub fn make_fitting_lock(
        &mut self,
        ptr: VAddr,
        size: &mut FrameSize,
        readonly: bool,
    ) -> Result<Option<NonNull<u8>>, B::Error> {
        assert!(ptr != 0, "locking the null address");
        *size = (*size).min(self.classes[BIG].frame_size);

        let mut unused: [i16; 3] = [NIL; 3];
        let mut pci: usize = 0;
        let mut page: i16 = NIL;

        'scan: for pj in 0..3 {
            let mut i = self.classes[pj].locked_head;
            while i != NIL {
                let fi = i as usize;
                let (fstart, fsize, flocks, fnext) = {
                    let f = &self.classes[pj].frames[fi];
                    (f.start, f.size, f.locks, f.next)
                };

                if ptr >= fstart && ptr < fstart + fsize as VAddr {
                    pci = pj;
                    page = i;
                    break 'scan;
                }

                if ptr < fstart && ptr + *size as VAddr > fstart {
                    if flocks == 0 {
                        i = self.free_locked_page(pj, i)?;
                        continue;
                    }
                    // Shrink the request to stop short of the pinned lock.
                    *size = (fstart - ptr) as FrameSize;
                }

                if flocks == 0 && unused[pj] == NIL {
                    unused[pj] = i;
                }

                i = fnext;
            }
        }

        let mut offset = 0usize;

        if page == NIL {
            // Best fit: the smallest class with an available frame that
            // still holds the request; failing that, the largest
            // available class, clamping the request to its frame size.
            let mut fitting: Option<usize> = None;
            let mut smaller: Option<usize> = None;
            for j in 0..3 {
                if self.classes[j].free_head != NIL || unused[j] != NIL {
                    if *size <= self.classes[j].frame_size {
                        if fitting.is_none() {
                            fitting = Some(j);
                        }
                    } else {
                        smaller = Some(j);
                    }
                }
            }

            pci = match (fitting, smaller) {
                (Some(j), _) => j,
                (None, Some(j)) => {
                    *size = self.classes[j].frame_size;
                    j
                }
                (None, None) => {
                    debug!("no frame available for fitting lock at {}", ptr);
                    return Ok(None);
                }
            };

            let mut sync_pool = true;
            if self.classes[pci].free_head != NIL {
                page = self.lock_page(pci, ptr, *size)?;
                // Big frames were filled when the pull locked them.
                sync_pool = pci != BIG;
            } else {
                page = unused[pci];
                self.sync_locked_page(pci, page as usize)?;
                self.classes[pci].frames[page as usize].dirty = false;
            }

            if sync_pool {
                let mut dst = mem::take(&mut self.classes[pci].frames[page as usize].pool);
                let res = self.copy_raw_data(&mut dst[..*size as usize], ptr);
                self.classes[pci].frames[page as usize].pool = dst;
                res?;
            }

            let f = &mut self.classes[pci].frames[page as usize];
            f.start = ptr;
            f.size = *size;
        } else {
            // The containing lock's start may be below the request.
            let f = &self.classes[pci].frames[page as usize];
            offset = (ptr - f.start) as usize;
            *size = (*size).min((f.size as usize - offset) as FrameSize);
        }

        let f = &mut self.classes[pci].frames[page as usize];
        f.locks += 1;
        if !f.dirty {
            f.dirty = !readonly;
        }
        debug!(
            "fitting lock {} + {} in class {} frame {}",
            ptr, size, pci, page
        );
        Ok(Some(unsafe {
            NonNull::new_unchecked(f.pool.as_mut_ptr().add(offset))
        }))
    }

    /// Drop one pin from the lock containing `ptr`.
    ///
    /// When the last pin on a big frame goes away, the frame returns to
    /// the working set. Small and medium frames stay parked on the
    /// locked chain so a later lock at the same address can reuse them
    /// in place.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not inside any locked range; that is a caller
    /// bug.
    pub fn release_lock(&mut self, ptr: VAddr) -> Result<(), B::Error> {
        let mut found = None;
        for ci in 0..3 {
            let idx = self.classes[ci].find_locked(ptr);
            if idx != NIL {
                found = Some((ci, idx));
                break;
            }
        }
        let (ci, idx) = found.expect("releasing an address that is not locked");

        let f = &mut self.classes[ci].frames[idx as usize];
        assert!(f.locks > 0, "lock count underflow");
        f.locks -= 1;

        if f.locks == 0 && ci == BIG {
            self.free_locked_page(BIG, idx)?;
        }
        Ok(())
    }
}
