//! Integration tests: longer allocate/release/resize traces against a
//! standalone `Heap`, asserting the checker holds after every operation.

use proptest::prelude::*;
use std::collections::HashMap;
use std::ptr;
use triheap::{checker, Heap, SystemHeapSource};

fn fresh_heap() -> Heap<SystemHeapSource> {
    Heap::new(SystemHeapSource::with_capacity(16 * 1024 * 1024))
}

/// A synthetic trace touching all three regimes, releasing a sliding window
/// of the oldest live allocations so the heap both grows and coalesces.
#[test]
fn long_mixed_trace_keeps_every_invariant() {
    let mut heap = fresh_heap();
    let mut live: Vec<*mut u8> = Vec::new();
    let sizes = [
        1usize, 15, 16, 17, 63, 64, 65, 127, 128, 500, 600, 2000, 3000, 4080, 4096, 8192, 20000,
    ];

    for &size in sizes.iter().cycle().take(200) {
        let p = heap.allocate(size);
        assert!(!p.is_null(), "allocate({size}) unexpectedly failed");
        checker::check(&heap).expect("checker after allocate");
        live.push(p);
        if live.len() > 5 {
            let old = live.remove(0);
            heap.release(old);
            checker::check(&heap).expect("checker after release");
        }
    }
    for p in live {
        heap.release(p);
        checker::check(&heap).expect("checker after final release");
    }
}

/// `release(allocate(s))` on an otherwise-empty heap returns it to the same
/// byte-equivalent state.
#[test]
fn allocate_then_release_restores_an_empty_heap() {
    let mut heap = fresh_heap();
    let p = heap.allocate(600);
    assert!(!p.is_null());
    let start_after_alloc = heap.heap_start();
    heap.release(p);
    checker::check(&heap).unwrap();
    // The arena is never returned to the OS, so heap_start stays put; the
    // released slab goes back to the slab-bin pool instead.
    assert_eq!(heap.heap_start(), start_after_alloc);
}

/// `resize(P, s')` preserves bytes `0..min(s, s')`, whichever pointer it
/// returns.
#[test]
fn resize_preserves_the_shared_prefix_across_regimes() {
    let mut heap = fresh_heap();
    let p = heap.allocate(100);
    assert!(!p.is_null());
    unsafe {
        for i in 0..100u8 {
            p.add(i as usize).write(i);
        }
    }
    // Grows into the large regime, almost certainly forcing a migration.
    let q = heap.resize(p, 20000);
    assert!(!q.is_null());
    unsafe {
        for i in 0..100u8 {
            assert_eq!(q.add(i as usize).read(), i);
        }
    }
    checker::check(&heap).unwrap();
    heap.release(q);
}

#[derive(Clone, Debug)]
enum Op {
    Allocate(usize),
    Release(usize),
    Resize(usize, usize),
}

fn size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        (1usize..=16),
        (17usize..=128),
        (129usize..=512),
        (513usize..=4080),
        (4081usize..=9000),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        size_strategy().prop_map(Op::Allocate),
        (0usize..64).prop_map(Op::Release),
        (0usize..64, size_strategy()).prop_map(|(i, s)| Op::Resize(i, s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Replays a random operation trace against both the allocator and a
    /// `HashMap` shadow model, checking the content round-trip law and the
    /// full consistency checker after every step.
    #[test]
    fn random_traces_preserve_the_content_round_trip_law(ops in proptest::collection::vec(op_strategy(), 1..120)) {
        let mut heap = fresh_heap();
        let mut shadow: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut live: Vec<*mut u8> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    let p = heap.allocate(size);
                    if p.is_null() {
                        continue;
                    }
                    let bytes: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
                    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), p, size) };
                    shadow.insert(p as usize, bytes);
                    live.push(p);
                    prop_assert!(checker::check(&heap).is_ok());
                }
                Op::Release(idx) => {
                    if live.is_empty() {
                        continue;
                    }
                    let i = idx % live.len();
                    let p = live.remove(i);
                    shadow.remove(&(p as usize));
                    heap.release(p);
                    prop_assert!(checker::check(&heap).is_ok());
                }
                Op::Resize(idx, new_size) => {
                    if live.is_empty() {
                        continue;
                    }
                    let i = idx % live.len();
                    let p = live[i];
                    let old = shadow.remove(&(p as usize)).unwrap();
                    let q = heap.resize(p, new_size);
                    if q.is_null() {
                        // On OOM the original pointer is left untouched.
                        shadow.insert(p as usize, old);
                        continue;
                    }
                    let common = old.len().min(new_size);
                    let mut actual = vec![0u8; common];
                    unsafe { ptr::copy_nonoverlapping(q, actual.as_mut_ptr(), common) };
                    prop_assert_eq!(&actual[..], &old[..common]);
                    let mut new_content = actual;
                    new_content.resize(new_size, 0xCD);
                    unsafe { ptr::copy_nonoverlapping(new_content.as_ptr(), q, new_size) };
                    shadow.remove(&(p as usize));
                    shadow.insert(q as usize, new_content);
                    live[i] = q;
                    prop_assert!(checker::check(&heap).is_ok());
                }
            }
        }

        for p in live {
            heap.release(p);
        }
        prop_assert!(checker::check(&heap).is_ok());
    }
}
