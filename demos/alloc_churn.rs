//! Allocate and free blocks of many sizes and watch the free list.

use virtpool::{PoolConfig, StaticBacking, VirtAlloc};

fn main() {
    env_logger::init();

    let mut va = VirtAlloc::new(StaticBacking::new(128 * 1024), PoolConfig::default());
    va.start().expect("starting the allocator");

    let mut blocks = Vec::new();
    for i in 0..24u32 {
        let size = 48 + i * 32;
        let ptr = va.alloc_raw(size).expect("pool I/O failed");
        assert!(ptr != 0, "out of virtual memory");
        blocks.push(ptr);
    }
    println!("allocated {} blocks, {} bytes in use", blocks.len(), va.stats().mem_used);

    // Free every other block, then the rest; coalescing folds the free
    // list back together.
    for ptr in blocks.iter().skip(1).step_by(2) {
        va.free_raw(*ptr).expect("pool I/O failed");
    }
    let (validity, stats) = va.free_list_stats().expect("pool I/O failed");
    assert!(validity.is_valid());
    println!("after freeing half: {} free blocks, {} bytes free", stats.length, stats.size);

    for ptr in blocks.iter().step_by(2) {
        va.free_raw(*ptr).expect("pool I/O failed");
    }
    let (validity, stats) = va.free_list_stats().expect("pool I/O failed");
    assert!(validity.is_valid());
    println!("after freeing all: {} free block(s), {} bytes free", stats.length, stats.size);

    va.stop().expect("stopping the allocator");
}
