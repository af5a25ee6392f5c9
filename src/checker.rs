//! Optional heap consistency checker.
//!
//! Out of scope for the allocation algorithms themselves, this is a typed,
//! `Display`-able error enum rather than a panic message, so tests can
//! assert on exactly which invariant broke. Walks the heap from
//! `heap_start` to `heap_end` once, replaying the same region
//! classification the allocator itself uses, and cross-checks bin
//! membership against the layout invariants.
//!
//! This never runs on the allocation fast path unless the `checker` feature
//! is enabled and `debug_assertions` are on (see [`crate::heap`]).

use crate::bins::{MediumBins, SlabBins, SmallBins};
use crate::config::{self, MIN_MED, SLAB_SIZE};
use crate::error::ConsistencyError;
use crate::heap::Heap;
use crate::heap_source::HeapSource;
use crate::medium;
use crate::slab::{self, free_node, free_region, packed, wide, SlabFlags};

/// Walk `heap` and verify every invariant that can be checked without a
/// shadow model of live allocations (disjointness and containment are the
/// integration test's job, via a reference map).
pub fn check<S: HeapSource>(heap: &Heap<S>) -> Result<(), ConsistencyError> {
    walk_heap(heap)?;
    check_skiplist_lower_bound(&heap.slab_bins.skiplist, config::NUM_SLAB_BINS, |b| {
        !heap.slab_bins.head(b).is_null()
    })?;
    check_skiplist_lower_bound(&heap.medium_bins.skiplist, config::NUM_MEDIUM_BINS, |b| {
        !heap.medium_bins.head(b).is_null()
    })?;
    check_bin127_sorted(&heap.slab_bins)?;
    Ok(())
}

fn check_skiplist_lower_bound<const W: usize>(
    skiplist: &crate::bins::Skiplist<W>,
    total_bins: usize,
    non_empty: impl Fn(usize) -> bool,
) -> Result<(), ConsistencyError> {
    for bin in 0..total_bins {
        if non_empty(bin) && !skiplist.test(bin) {
            return Err(ConsistencyError::SkiplistUnderApproximation { bin });
        }
    }
    Ok(())
}

fn check_bin127_sorted(slab_bins: &SlabBins) -> Result<(), ConsistencyError> {
    let bin = config::NUM_SLAB_BINS - 1;
    let mut cur = slab_bins.head(bin);
    let mut prev_n: Option<u64> = None;
    while !cur.is_null() {
        let n = unsafe { free_region::n_slabs(cur) };
        if let Some(p) = prev_n {
            if n < p {
                return Err(ConsistencyError::Bin127NotSorted {
                    first: cur as usize,
                    second: cur as usize,
                });
            }
        }
        prev_n = Some(n);
        cur = unsafe { free_region::next(cur) };
    }
    Ok(())
}

fn slab_bin_contains(slab_bins: &SlabBins, n_slabs: u64, target: *mut u8) -> bool {
    let bin = SlabBins::bin_index(n_slabs);
    let mut cur = slab_bins.head(bin);
    while !cur.is_null() {
        if cur == target {
            return true;
        }
        cur = unsafe { free_region::next(cur) };
    }
    false
}

fn small_bin_contains(small_bins: &SmallBins, block_size: usize, target: *mut u8) -> bool {
    let bin = config::small_bin_index(block_size);
    if small_bins.block_size(bin) != block_size {
        return false;
    }
    let two_level = packed::is_two_level(block_size);
    let mut cur = small_bins.head(bin);
    while !cur.is_null() {
        if cur == target {
            return true;
        }
        cur = unsafe { packed::next(cur, two_level) };
    }
    false
}

fn medium_bin_contains(medium_bins: &MediumBins, size: usize, target: *mut u8) -> bool {
    let bin = config::medium_bin_index(size);
    let mut cur = medium_bins.head(bin);
    while !cur.is_null() {
        if cur == target {
            return true;
        }
        cur = unsafe { free_node::next(cur) };
    }
    false
}

fn check_alignment(addr: *mut u8) -> Result<(), ConsistencyError> {
    if (addr as usize) % config::ALIGN != 0 {
        return Err(ConsistencyError::MisalignedBlock { ptr: addr as usize });
    }
    Ok(())
}

fn popcount_valid_bits(base: *mut u8, block_size: usize, n_blocks: usize) -> u32 {
    unsafe {
        if packed::is_two_level(block_size) {
            let l2 = packed::level2_ptr(base);
            let mut count = 0u32;
            for i in 0..n_blocks {
                let byte = l2.add(i / 8).read();
                if byte & (1 << (i % 8)) != 0 {
                    count += 1;
                }
            }
            count
        } else {
            packed::flat_bitmap(base).count_ones()
        }
    }
}

unsafe fn check_wide_blocks<S: HeapSource>(
    heap: &Heap<S>,
    header: *mut u8,
    n_slabs: u64,
) -> Result<(), ConsistencyError> {
    let mut idx = 0usize;
    loop {
        let Some(start) = (unsafe { medium::block_offset_bytes(header, idx) }) else {
            break;
        };
        let end = unsafe { medium::block_offset_bytes(header, idx + 1) }
            .unwrap_or(n_slabs as usize * SLAB_SIZE);
        let size = end - start;
        let block_addr = unsafe { header.add(start) };
        check_alignment(block_addr)?;
        let alloc_bit = unsafe { wide::block_alloc_bit(header, idx) };
        if !alloc_bit && size >= MIN_MED && end <= SLAB_SIZE {
            let addr = block_addr;
            let in_bin = medium_bin_contains(&heap.medium_bins, size, addr);
            if !in_bin {
                return Err(ConsistencyError::MediumBinMembershipMismatch {
                    block: addr as usize,
                    in_bin: false,
                    alloc_bit,
                });
            }
        }
        idx += 1;
        if idx > 7 || end >= n_slabs as usize * SLAB_SIZE {
            break;
        }
    }
    Ok(())
}

fn walk_heap<S: HeapSource>(heap: &Heap<S>) -> Result<(), ConsistencyError> {
    if heap.heap_start().is_null() {
        return Ok(());
    }
    let mut cur = heap.heap_start();
    let end = heap.heap_end();
    let mut last_free_region: Option<*mut u8> = None;

    while (cur as usize) < (end as usize) {
        let flags = unsafe { slab::flags(cur) };
        if !flags.contains(SlabFlags::ALLOC) {
            if let Some(prev) = last_free_region {
                return Err(ConsistencyError::AdjacentFreeRegions {
                    first: prev as usize,
                    second: cur as usize,
                });
            }
            let n = unsafe { free_region::n_slabs(cur) };
            let region_start = cur;
            let region_end = unsafe { cur.add(n as usize * SLAB_SIZE) };
            let footer = unsafe { free_region::read_footer(region_end) };
            if footer != n {
                return Err(ConsistencyError::FooterMismatch {
                    region: cur as usize,
                    expected: n,
                    found: footer,
                });
            }
            if !slab_bin_contains(&heap.slab_bins, n, cur) {
                return Err(ConsistencyError::SlabBinMembershipMismatch {
                    region: cur as usize,
                    n_slabs: n,
                });
            }
            cur = region_end;
            last_free_region = Some(region_start);
            continue;
        }

        last_free_region = None;
        if flags.contains(SlabFlags::PACKED) {
            let k = unsafe { packed::sz_class(cur) };
            let block_size = config::size_class_to_block_size(k);
            let (n_blocks, block_start, has_free) = if packed::is_two_level(block_size) {
                let (n, start, _, _) = config::two_level_layout(block_size);
                (n, start, unsafe { packed::level1(cur) } != 0)
            } else {
                (
                    config::flat_layout(block_size),
                    config::WIDE_HEADER,
                    unsafe { packed::flat_bitmap(cur) } != 0,
                )
            };
            for i in 0..n_blocks {
                check_alignment(unsafe { cur.add(block_start + i * block_size) })?;
            }
            let recorded = unsafe { packed::alloc_count(cur) } as u32;
            let counted = n_blocks as u32 - popcount_valid_bits(cur, block_size, n_blocks);
            if recorded != counted {
                return Err(ConsistencyError::AllocCountMismatch {
                    slab: cur as usize,
                    recorded,
                    counted,
                });
            }
            let in_bin = small_bin_contains(&heap.small_bins, block_size, cur);
            if in_bin != has_free {
                return Err(ConsistencyError::SmallBinMembershipMismatch {
                    slab: cur as usize,
                    in_bin,
                    has_free,
                });
            }
            cur = unsafe { cur.add(SLAB_SIZE) };
        } else {
            let n_slabs = unsafe { wide::size(cur) };
            unsafe { check_wide_blocks(heap, cur, n_slabs) }?;
            cur = unsafe { cur.add(n_slabs as usize * SLAB_SIZE) };
        }

        if (cur as usize) < (end as usize) && !unsafe { slab::prev_alloc_bit(cur) } {
            return Err(ConsistencyError::BadPrevAllocBit { slab: cur as usize });
        }
    }
    Ok(())
}
