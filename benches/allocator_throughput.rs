//! Fixed-trace throughput benchmark. Not part of correctness testing; run
//! with `cargo bench`.

use std::time::Instant;
use triheap::{Heap, SystemHeapSource};

const SIZES: [usize; 10] = [8, 16, 32, 64, 128, 256, 600, 1500, 4096, 9000];
const ROUNDS: usize = 2000;
const LIVE_CAP: usize = 64;

fn trace_once(heap: &mut Heap<SystemHeapSource>) -> usize {
    let mut live = Vec::with_capacity(LIVE_CAP);
    let mut ops = 0usize;

    for round in 0..ROUNDS {
        let size = SIZES[round % SIZES.len()];
        let p = heap.allocate(size);
        ops += 1;
        if p.is_null() {
            continue;
        }
        live.push(p);

        if live.len() > LIVE_CAP {
            heap.release(live.remove(0));
            ops += 1;
        }

        if round % 7 == 0 && !live.is_empty() {
            let idx = round % live.len();
            let resized = heap.resize(live[idx], size * 2);
            if !resized.is_null() {
                live[idx] = resized;
            }
            ops += 1;
        }
    }

    for p in live {
        heap.release(p);
        ops += 1;
    }
    ops
}

fn main() {
    let mut heap = Heap::new(SystemHeapSource::with_capacity(64 * 1024 * 1024));
    trace_once(&mut heap); // warm up the arena before timing

    let iterations = 20;
    let start = Instant::now();
    let mut total_ops = 0usize;
    for _ in 0..iterations {
        total_ops += trace_once(&mut heap);
    }
    let elapsed = start.elapsed();
    let ops_per_sec = total_ops as f64 / elapsed.as_secs_f64();
    println!("triheap allocator_throughput: {total_ops} ops in {elapsed:?} ({ops_per_sec:.0} ops/sec)");
}
