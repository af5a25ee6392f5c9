//! Slab lifecycle: acquiring fresh runs of slabs from the segregated
//! slab-bins or the heap source, and returning runs to those bins with
//! coalescing.

use crate::config::SLAB_SIZE;
use crate::heap::Heap;
use crate::heap_source::HeapSource;
use crate::slab::{self, free_region, SlabFlags};
use core::ptr;
use log::debug;

/// Acquire a run of `n` contiguous slabs, marking it `ALLOC` and setting
/// `PREV_ALLOC` on whatever follows. Returns the run's base, or null on
/// out-of-memory.
pub unsafe fn acquire_slabs<S: HeapSource>(heap: &mut Heap<S>, n: u64) -> *mut u8 {
    debug_assert!(n >= 1);
    if let Some(base) = take_from_bins(heap, n) {
        unsafe { finish_acquire(heap, base, n) };
        return base;
    }
    unsafe { acquire_by_growing(heap, n) }
}

/// Search `slab_bins` (exact bin first, then the sorted overflow bin),
/// splitting an oversize region if needed. Returns the unlinked base of a
/// region at least `n` slabs long, still carrying its free-region header.
unsafe fn take_from_bins<S: HeapSource>(heap: &mut Heap<S>, n: u64) -> Option<*mut u8> {
    let start_bin = crate::bins::SlabBins::bin_index(n);
    let scan = heap
        .slab_bins
        .skiplist
        .scan_from(start_bin, crate::config::NUM_SLAB_BINS);
    let mut found_bin = None;
    for bin in scan {
        let head = heap.slab_bins.head(bin);
        if head.is_null() {
            heap.slab_bins.skiplist.clear(bin);
            continue;
        }
        found_bin = Some(bin);
        break;
    }
    let bin = found_bin?;
    let head = heap.slab_bins.head(bin);
    let region_slabs = unsafe { free_region::n_slabs(head) };
    debug_assert!(region_slabs >= n);
    unsafe { heap.slab_bins.unlink(head, region_slabs) };

    if region_slabs == n {
        return Some(head);
    }

    // Split: keep the tail `region_slabs - n` slabs as a fresh free region.
    let tail = unsafe { head.add((n * SLAB_SIZE as u64) as usize) };
    let tail_slabs = region_slabs - n;
    unsafe {
        slab::set_flags(tail, SlabFlags::PREV_ALLOC);
        free_region::set_n_slabs(tail, tail_slabs);
        free_region::write_footer(tail, tail_slabs);
        heap.slab_bins.link(tail, tail_slabs);
    }
    Some(head)
}

/// Mark the acquired run `ALLOC`, mark its physical successor's
/// `PREV_ALLOC` (or flip `last_slab_alloc` if there is none), and mark
/// every non-head slab of a multi-slab run as a continuation slab.
unsafe fn finish_acquire<S: HeapSource>(heap: &mut Heap<S>, base: *mut u8, n: u64) {
    unsafe {
        slab::set_flags(base, SlabFlags::ALLOC | SlabFlags::PREV_ALLOC);
        mark_continuations(base, n);
        let successor = base.add((n * SLAB_SIZE as u64) as usize);
        if successor as usize >= heap.heap_end as usize {
            heap.last_slab_alloc = true;
        } else {
            slab::set_prev_alloc_bit(successor, true);
        }
    }
    debug!("lifecycle: acquired {n} slab(s) at {:p}", base);
}

unsafe fn mark_continuations(base: *mut u8, n: u64) {
    unsafe {
        let mut s = base.add(SLAB_SIZE);
        for _ in 1..n {
            slab::continuation::mark(s, base);
            s = s.add(SLAB_SIZE);
        }
    }
}

/// Out-of-memory path: extend the heap by exactly enough slabs, folding in
/// the trailing free region if the physically last slab is currently free.
unsafe fn acquire_by_growing<S: HeapSource>(heap: &mut Heap<S>, n: u64) -> *mut u8 {
    if !heap.last_slab_alloc {
        // The trailing free region (if any) is extended in place.
        if let Some((region_base, region_slabs)) = unsafe { find_trailing_free_region(heap) } {
            let need = n.saturating_sub(region_slabs);
            if need > 0 {
                let grown = heap.heap_source.extend_heap((need * SLAB_SIZE as u64) as usize);
                if grown.is_null() {
                    return ptr::null_mut();
                }
                debug_assert_eq!(grown as usize, heap.heap_end as usize);
                heap.heap_end = unsafe { heap.heap_end.add((need * SLAB_SIZE as u64) as usize) };
            }
            unsafe { heap.slab_bins.unlink(region_base, region_slabs) };
            unsafe { finish_acquire(heap, region_base, n) };
            return region_base;
        }
    }

    let bytes = (n * SLAB_SIZE as u64) as usize;
    let base = heap.heap_source.extend_heap(bytes);
    if base.is_null() {
        return ptr::null_mut();
    }
    if heap.heap_start.is_null() {
        heap.heap_start = base;
        heap.heap_end = base;
    }
    debug_assert_eq!(base as usize, heap.heap_end as usize);
    heap.heap_end = unsafe { heap.heap_end.add(bytes) };
    unsafe { finish_acquire(heap, base, n) };
    base
}

/// Locate the free region ending exactly at `heap_end`, if the physically
/// last slab is free, via its footer.
unsafe fn find_trailing_free_region<S: HeapSource>(heap: &Heap<S>) -> Option<(*mut u8, u64)> {
    if heap.heap_end as usize == heap.heap_start as usize {
        return None;
    }
    let n = unsafe { free_region::read_footer(heap.heap_end) };
    if n == 0 {
        return None;
    }
    let base = unsafe { heap.heap_end.sub((n * SLAB_SIZE as u64) as usize) };
    Some((base, n))
}

/// Return `n` slabs at `base` to the free-slab pool, coalescing with both
/// physical neighbors.
pub unsafe fn release_slabs<S: HeapSource>(heap: &mut Heap<S>, base: *mut u8, n: u64) {
    unsafe { release_inner(heap, base, n, true) }
}

/// As [`release_slabs`], but never merges with the physical predecessor
/// (used when the predecessor is known to still be a live block, e.g. a
/// large block shrinking and returning its tail slabs).
pub unsafe fn release_remainder_slabs<S: HeapSource>(heap: &mut Heap<S>, base: *mut u8, n: u64) {
    unsafe { release_inner(heap, base, n, false) }
}

unsafe fn release_inner<S: HeapSource>(
    heap: &mut Heap<S>,
    mut base: *mut u8,
    mut n: u64,
    merge_predecessor: bool,
) {
    // `PREV_ALLOC` on `base` itself records whether our physical predecessor
    // is free, per invariant 2 — we never probe the predecessor's own bytes
    // to find out, since only a free region's *head* slab carries flags.
    if merge_predecessor
        && base as usize != heap.heap_start as usize
        && !unsafe { slab::flags(base) }.contains(SlabFlags::PREV_ALLOC)
    {
        let prev_n = unsafe { free_region::read_footer(base) };
        let prev_base = unsafe { base.sub((prev_n * SLAB_SIZE as u64) as usize) };
        unsafe { heap.slab_bins.unlink(prev_base, prev_n) };
        base = prev_base;
        n += prev_n;
    }

    let successor = unsafe { base.add((n * SLAB_SIZE as u64) as usize) };
    if successor as usize >= heap.heap_end as usize {
        heap.last_slab_alloc = false;
    } else if unsafe { slab::is_free(successor) } {
        let succ_n = unsafe { free_region::n_slabs(successor) };
        unsafe { heap.slab_bins.unlink(successor, succ_n) };
        n += succ_n;
    } else {
        unsafe { slab::set_prev_alloc_bit(successor, false) };
    }

    unsafe {
        // A free region's predecessor can never itself be free (invariant 1
        // forbids two adjacent free regions), so PREV_ALLOC is always set.
        slab::set_flags(base, SlabFlags::PREV_ALLOC);
        free_region::set_n_slabs(base, n);
        free_region::write_footer(base, n);
        heap.slab_bins.link(base, n);
    }
    debug!("lifecycle: released {n} slab(s) at {:p}", base);
}
