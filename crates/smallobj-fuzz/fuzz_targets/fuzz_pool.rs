#![no_main]
use libfuzzer_sys::fuzz_target;

use smallobj_core::{MeteredHeap, Pool, PoolConfig, PoolMode};

// Each 4-byte chunk is one operation: [op, size_lo, size_hi, fill].
// The first byte of input picks mode, refill batch and a byte budget so the
// exhaustion paths are reached too.
fuzz_target!(|data: &[u8]| {
    let Some((&header, ops)) = data.split_first() else {
        return;
    };

    let mode = if header & 1 == 0 {
        PoolMode::Strict
    } else {
        PoolMode::Hardened
    };
    let batch = 1 + usize::from(header >> 4) * 4;
    let budget = match (header >> 1) & 0b111 {
        0 => Some(256),
        1 => Some(4096),
        2 => Some(65_536),
        _ => None,
    };
    let config = PoolConfig::default()
        .with_mode(mode)
        .with_objects_per_refill(batch);
    let mut pool = Pool::with_system(MeteredHeap::new().budget(budget), config);

    // (ptr, bytes, fill)
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
    let mut last_acquired = 0;

    for chunk in ops.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]])) % 600;
        let fill = chunk[3];

        match chunk[0] % 4 {
            0 | 1 => {
                if let Ok(p) = pool.allocate(size) {
                    assert_eq!(p.as_ptr() as usize % 8, 0);
                    unsafe { p.as_ptr().write_bytes(fill, size) };
                    live.push((p.as_ptr(), size, fill));
                }
            }
            2 => {
                if live.is_empty() {
                    continue;
                }
                let (ptr, bytes, fill) = live.swap_remove(size % live.len());
                for off in 0..bytes {
                    assert_eq!(unsafe { *ptr.add(off) }, fill, "block clobbered");
                }
                unsafe { pool.deallocate(ptr, bytes) };
            }
            _ => {
                if live.is_empty() {
                    continue;
                }
                let idx = usize::from(fill) % live.len();
                let (ptr, bytes, old_fill) = live[idx];
                if let Ok(out) = unsafe { pool.reallocate(ptr, bytes, size) } {
                    for off in 0..bytes.min(size) {
                        assert_eq!(unsafe { *out.as_ptr().add(off) }, old_fill);
                    }
                    unsafe { out.as_ptr().write_bytes(fill, size) };
                    live[idx] = (out.as_ptr(), size, fill);
                }
            }
        }

        // Live blocks never overlap.
        let mut spans: Vec<(usize, usize)> = live
            .iter()
            .map(|&(p, bytes, _)| (p as usize, bytes.max(1)))
            .collect();
        spans.sort_unstable();
        for w in spans.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "live blocks overlap");
        }

        let acquired = pool.total_acquired();
        assert!(acquired >= last_acquired);
        last_acquired = acquired;
    }

    for (ptr, bytes, _) in live {
        unsafe { pool.deallocate(ptr, bytes) };
    }
    assert_eq!(pool.stats().pooled_live, 0);
    assert_eq!(pool.stats().size_mismatches, 0);
});
