use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

use virtpool::{PoolConfig, StaticBacking, VirtAlloc, VSize};

/// Bytes a request of `size` occupies in the pool: whole header units,
/// plus one unit for the header itself.
fn block_bytes(size: VSize) -> u64 {
    (((size + 7) / 8 + 1) * 8) as u64
}

#[test]
fn test_stress() {
    let mut va = VirtAlloc::new(StaticBacking::new(256 * 1024), PoolConfig::default());
    va.start().unwrap();

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    // Slot table: address, size, and the byte the block was filled with.
    let mut slots: Vec<Option<(u32, VSize, u8)>> = vec![None; 96];
    let mut live_bytes: u64 = 0;

    for step in 0..4096 {
        let idx = rng.gen_range(0..slots.len());
        match slots[idx].take() {
            None => {
                let size: VSize = rng.gen_range(1..=768);
                let ptr = va.alloc_raw(size).unwrap();
                if ptr == 0 {
                    // Pool exhausted under churn; retry after more frees.
                    continue;
                }
                let fill = rng.gen::<u8>();
                let data = vec![fill; size as usize];
                let mut off = 0;
                while off < size {
                    let n = (size - off).min(512);
                    va.write(ptr + off, &data[off as usize..(off + n) as usize])
                        .unwrap();
                    off += n;
                }
                slots[idx] = Some((ptr, size, fill));
                live_bytes += block_bytes(size);
            }
            Some((ptr, size, fill)) => {
                // The block's contents must have survived everything
                // that happened since it was written.
                let mut off = 0;
                while off < size {
                    let n = (size - off).min(512);
                    let got = va.read(ptr + off, n).unwrap();
                    assert!(
                        got.iter().all(|&b| b == fill),
                        "step {}: block at {} (size {}) corrupted",
                        step,
                        ptr,
                        size
                    );
                    off += n;
                }
                va.free_raw(ptr).unwrap();
                live_bytes -= block_bytes(size);
            }
        }

        let (validity, stats) = va.free_list_stats().unwrap();
        log::debug!(
            "step {}: live {} bytes, free list {:?}, validity {:?}",
            step,
            live_bytes,
            stats,
            validity
        );
        assert!(validity.is_valid(), "step {}: {:?}", step, validity);
        assert_eq!(
            va.stats().mem_used,
            live_bytes,
            "step {}: allocation accounting drifted",
            step
        );
    }

    // Drain what is left; the free list must collapse back into a
    // small number of coalesced blocks.
    for slot in slots.iter_mut() {
        if let Some((ptr, _, _)) = slot.take() {
            va.free_raw(ptr).unwrap();
        }
    }
    let (validity, _) = va.free_list_stats().unwrap();
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(va.stats().mem_used, 0);
}
