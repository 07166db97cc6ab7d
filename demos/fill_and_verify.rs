//! Fill a file-backed virtual pool with a pattern and read it back.
//!
//! The pool is sixteen times larger than all page frames together, so
//! the data is continuously paged in and out of the file while being
//! written and verified.

use virtpool::{FileBacking, PoolConfig, VirtAlloc};

fn main() {
    env_logger::init();

    let path = std::env::temp_dir().join("virtpool-demo.pool");
    let store = FileBacking::create(&path, 1024 * 1024).expect("creating the pool file");
    let mut va = VirtAlloc::new(store, PoolConfig::default());
    va.start().expect("starting the allocator");

    let len: u32 = 256 * 1024;
    let ptr = va.alloc_raw(len).expect("pool I/O failed");
    assert!(ptr != 0, "out of virtual memory");
    println!("allocated {} KiB at virtual address {}", len / 1024, ptr);

    let chunk = 1024;
    let mut off = 0;
    while off < len {
        let bytes: Vec<u8> = (off..off + chunk).map(|i| i as u8).collect();
        va.write(ptr + off, &bytes).expect("pool I/O failed");
        off += chunk;
    }
    println!("pattern written, flushing");
    va.flush().expect("pool I/O failed");

    let mut off = 0;
    while off < len {
        let expected: Vec<u8> = (off..off + chunk).map(|i| i as u8).collect();
        let got = va.read(ptr + off, chunk).expect("pool I/O failed");
        assert_eq!(got, &expected[..], "mismatch at offset {}", off);
        off += chunk;
    }

    let stats = va.stats();
    println!(
        "verified {} KiB: {} page reads, {} page writes, {} bytes of store traffic",
        len / 1024,
        stats.big_page_reads,
        stats.big_page_writes,
        stats.bytes_read + stats.bytes_written
    );

    va.stop().expect("stopping the allocator");
    let _ = std::fs::remove_file(&path);
}
