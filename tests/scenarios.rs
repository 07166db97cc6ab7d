//! End-to-end scenarios exercising the public allocator surface.

use test_log::test;

use virtpool::{
    FrameSize, PageClass, PageGeometry, PoolConfig, StaticBacking, VAddr, VirtAlloc,
};

fn config(small: (u16, u8), medium: (u16, u8), big: (u16, u8)) -> PoolConfig {
    PoolConfig {
        small: PageGeometry::new(small.0, small.1),
        medium: PageGeometry::new(medium.0, medium.1),
        big: PageGeometry::new(big.0, big.1),
        ..PoolConfig::default()
    }
}

fn started(pool_size: u32, config: PoolConfig) -> VirtAlloc<StaticBacking> {
    let mut va = VirtAlloc::new(StaticBacking::new(pool_size), config);
    va.start().unwrap();
    va
}

fn write_pattern(va: &mut VirtAlloc<StaticBacking>, ptr: VAddr, len: u32, chunk: u32) {
    let mut off = 0;
    while off < len {
        let n = chunk.min(len - off);
        let bytes: Vec<u8> = (off..off + n).map(|i| i as u8).collect();
        va.write(ptr + off, &bytes).unwrap();
        off += n;
    }
}

fn verify_pattern(va: &mut VirtAlloc<StaticBacking>, ptr: VAddr, len: u32, chunk: u32) {
    let mut off = 0;
    while off < len {
        let n = chunk.min(len - off);
        let expected: Vec<u8> = (off..off + n).map(|i| i as u8).collect();
        assert_eq!(
            va.read(ptr + off, n).unwrap(),
            &expected[..],
            "mismatch at offset {}",
            off
        );
        off += n;
    }
}

#[test]
fn fill_and_verify_a_large_block() {
    let mut va = started(1024 * 1024, config((64, 4), (256, 4), (1024, 4)));

    let len = 120 * 1024;
    let ptr = va.alloc_raw(len).unwrap();
    assert_ne!(ptr, 0);

    write_pattern(&mut va, ptr, len, 1024);
    verify_pattern(&mut va, ptr, len, 1024);

    // The block is far larger than all frames together, so it must have
    // been paged in and out of the store.
    assert!(va.stats().big_page_writes > 0);
}

#[test]
fn free_neighbors_coalesce_into_one_block() {
    let mut va = started(64 * 1024, config((64, 4), (256, 4), (1024, 4)));

    let a = va.alloc_raw(256).unwrap();
    let b = va.alloc_raw(256).unwrap();
    let c = va.alloc_raw(256).unwrap();
    assert!(a != 0 && b != 0 && c != 0);

    va.free_raw(b).unwrap();
    va.free_raw(a).unwrap();
    va.free_raw(c).unwrap();

    let (validity, stats) = va.free_list_stats().unwrap();
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(stats.length, 1);
    // Three blocks of 256 bytes plus a header each.
    assert!(stats.size >= 3 * 256);
}

#[test]
fn overlapping_locks_stay_consistent() {
    let mut va = started(256 * 1024, config((64, 4), (256, 4), (2048, 4)));

    let ptr = va.alloc_raw(4096).unwrap();
    assert_ne!(ptr, 0);

    let lock1 = va.make_data_lock(ptr, 2048, false).unwrap().unwrap();
    let buf1 = unsafe { core::slice::from_raw_parts_mut(lock1.as_ptr(), 2048) };
    for (i, b) in buf1.iter_mut().enumerate() {
        *b = i as u8;
    }

    // The second lock shrinks the first one down to the gap between
    // them; the overlapping kilobyte must carry over.
    let lock2 = va.make_data_lock(ptr + 1024, 2048, false).unwrap().unwrap();
    let buf2 = unsafe { core::slice::from_raw_parts_mut(lock2.as_ptr(), 2048) };
    for (j, b) in buf2.iter().take(1024).enumerate() {
        assert_eq!(*b, (1024 + j) as u8);
    }

    // Writes through either pointer are visible to raw reads of the
    // respective ranges.
    buf2[0] = 0xA5;
    buf2[1023] = 0xA6;
    let buf1 = unsafe { core::slice::from_raw_parts_mut(lock1.as_ptr(), 1024) };
    buf1[0] = 0xB5;
    assert_eq!(va.read(ptr + 1024, 1).unwrap(), &[0xA5]);
    assert_eq!(va.read(ptr + 2047, 1).unwrap(), &[0xA6]);
    assert_eq!(va.read(ptr, 1).unwrap(), &[0xB5]);

    va.release_lock(ptr).unwrap();
    va.release_lock(ptr + 1024).unwrap();

    // After both locks drain back to the store, a plain read over the
    // whole range sees every byte written through either pointer.
    assert_eq!(va.read(ptr, 1).unwrap(), &[0xB5]);
    assert_eq!(va.read(ptr + 1024, 2).unwrap(), &[0xA5, 0x01]);
    let tail = va.read(ptr + 1500, 100).unwrap();
    let expected: Vec<u8> = (1500u32..1600).map(|i| i as u8).collect();
    assert_eq!(tail, &expected[..]);
}

#[test]
fn lock_release_then_alloc_reclaims_the_frame() {
    // A single big frame: the lock pins the whole working set, and the
    // allocator must get it back after release.
    let mut va = started(64 * 1024, config((32, 1), (128, 1), (2048, 1)));

    let ptr = va.alloc_raw(4096).unwrap();
    assert_ne!(ptr, 0);

    let lock = va.make_data_lock(ptr, 2048, false).unwrap().unwrap();
    unsafe { lock.as_ptr().write_bytes(0xCD, 2048) };
    va.release_lock(ptr).unwrap();

    // Header churn: allocations and frees that have to page through the
    // frame the lock just vacated.
    let mut blocks = Vec::new();
    for _ in 0..16 {
        let p = va.alloc_raw(64).unwrap();
        assert_ne!(p, 0);
        blocks.push(p);
    }
    for p in blocks {
        va.free_raw(p).unwrap();
    }

    // The locked bytes survived the churn.
    assert_eq!(va.read(ptr, 64).unwrap(), &[0xCD; 64][..]);
    assert_eq!(va.read(ptr + 1984, 64).unwrap(), &[0xCD; 64][..]);
}

#[test]
fn first_allocation_bootstraps_the_free_list() {
    let mut va = started(64 * 1024, PoolConfig::default());

    let p = va.alloc_raw(16).unwrap();
    assert_ne!(p, 0);
    va.free_raw(p).unwrap();
    let q = va.alloc_raw(16).unwrap();
    assert_eq!(p, q);
}

#[test]
fn pattern_survives_flush_and_page_clear() {
    let mut va = started(128 * 1024, PoolConfig::default());

    let len = 4096;
    let ptr = va.alloc_raw(len).unwrap();
    assert_ne!(ptr, 0);
    write_pattern(&mut va, ptr, len, 1024);

    va.flush().unwrap();
    va.clear_pages().unwrap();
    assert_eq!(va.free_big_pages(), va.page_count(PageClass::Big));

    verify_pattern(&mut va, ptr, len, 1024);
}

#[cfg(feature = "std")]
#[test]
fn file_pool_round_trips() {
    use virtpool::FileBacking;

    let store = FileBacking::from_file(tempfile::tempfile().unwrap(), 256 * 1024);
    let mut va = VirtAlloc::new(store, PoolConfig::default());
    va.start().unwrap();

    let len = 16 * 1024;
    let ptr = va.alloc_raw(len).unwrap();
    assert_ne!(ptr, 0);

    let mut off = 0;
    while off < len {
        let bytes: Vec<u8> = (off..off + 512).map(|i| (i * 7) as u8).collect();
        va.write(ptr + off, &bytes).unwrap();
        off += 512;
    }
    va.flush().unwrap();
    va.clear_pages().unwrap();

    let mut off = 0;
    while off < len {
        let expected: Vec<u8> = (off..off + 512).map(|i| (i * 7) as u8).collect();
        assert_eq!(va.read(ptr + off, 512).unwrap(), &expected[..]);
        off += 512;
    }
    va.stop().unwrap();
}

#[test]
fn independent_blocks_do_not_interfere() {
    let mut va = started(256 * 1024, config((64, 4), (256, 4), (512, 2)));

    let a = va.alloc_raw(600).unwrap();
    let b = va.alloc_raw(600).unwrap();
    va.write(a, &[0xAA; 512]).unwrap();
    va.write(b, &[0xBB; 512]).unwrap();
    va.write(a + 512, &[0xA1; 88]).unwrap();
    va.write(b + 512, &[0xB1; 88]).unwrap();

    // Lock traffic on a third region must not disturb either block.
    let c = va.alloc_raw(2048).unwrap();
    let lock = va.make_data_lock(c, 512, false).unwrap().unwrap();
    unsafe { lock.as_ptr().write_bytes(0xCC, 512) };
    va.release_lock(c).unwrap();

    assert_eq!(va.read(a, 512).unwrap(), &[0xAA; 512][..]);
    assert_eq!(va.read(a + 512, 88).unwrap(), &[0xA1; 88][..]);
    assert_eq!(va.read(b, 512).unwrap(), &[0xBB; 512][..]);
    assert_eq!(va.read(b + 512, 88).unwrap(), &[0xB1; 88][..]);
    assert_eq!(va.read(c, 512).unwrap(), &[0xCC; 512][..]);
}

#[test]
fn fitting_lock_size_reports_what_it_got() {
    let mut va = started(128 * 1024, PoolConfig::default());

    let ptr = va.alloc_raw(4096).unwrap();
    let _pin = va.make_data_lock(ptr + 512, 256, false).unwrap().unwrap();

    // The request has to stop short of the pinned lock.
    let mut size: FrameSize = 1024;
    let lock = va.make_fitting_lock(ptr, &mut size, false).unwrap().unwrap();
    assert_eq!(size, 512);

    unsafe { lock.as_ptr().write_bytes(0x42, size as usize) };
    assert_eq!(va.read(ptr, 8).unwrap(), &[0x42; 8][..]);

    va.release_lock(ptr).unwrap();
    va.release_lock(ptr + 512).unwrap();
}

#[test]
fn write_zeros_initializes_a_fresh_region() {
    let mut va = started(64 * 1024, PoolConfig::default());
    va.write_zeros(1024, 8192).unwrap();
    assert_eq!(va.read(1024, 256).unwrap(), &[0u8; 256][..]);
    assert_eq!(va.read(9024, 192).unwrap(), &[0u8; 192][..]);
}

#[test]
fn stats_track_paging_traffic() {
    let mut va = started(128 * 1024, PoolConfig::default());

    let ptr = va.alloc_raw(8192).unwrap();
    write_pattern(&mut va, ptr, 8192, 1024);
    va.flush().unwrap();

    let stats = va.stats();
    assert!(stats.mem_used > 8192);
    assert!(stats.max_mem_used >= stats.mem_used);
    assert!(stats.big_page_reads > 0);
    assert!(stats.big_page_writes > 0);
    assert!(stats.bytes_written > 0);

    va.reset_stats();
    assert_eq!(va.stats().bytes_read, 0);
    assert_eq!(va.stats().big_page_reads, 0);
}
