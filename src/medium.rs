//! Medium-block engine: variable-size blocks carved from a single slab (or
//! the head slab of a multi-slab run) via an 8-entry offset table.

use crate::config::{self, ALIGN, MIN_MED, SLAB_SIZE};
use crate::heap::Heap;
use crate::heap_source::HeapSource;
use crate::lifecycle;
use crate::slab::{self, wide, SlabFlags};
use core::ptr;
use log::trace;

/// Byte offset of logical block `i` (`0..=7`), or `None` if the table ends
/// before reaching it.
pub unsafe fn block_offset_bytes(base: *mut u8, i: usize) -> Option<usize> {
    if i == 0 {
        return Some(wide::FIRST_BLOCK_OFFSET);
    }
    if i > 7 {
        return None;
    }
    unsafe {
        let units = wide::block_off_units(base, i);
        if units == 0 {
            if wide::block_alloc_bit(base, i) {
                Some(SLAB_SIZE)
            } else {
                None
            }
        } else {
            Some(units as usize * ALIGN)
        }
    }
}

pub unsafe fn block_size_bytes(base: *mut u8, i: usize, n_slabs: u64) -> usize {
    unsafe {
        let start = block_offset_bytes(base, i).expect("block index out of range");
        let end = block_offset_bytes(base, i + 1).unwrap_or(n_slabs as usize * SLAB_SIZE);
        end - start
    }
}

pub unsafe fn find_block_index(base: *mut u8, ptr: *mut u8, n_slabs: u64) -> usize {
    let off = ptr as usize - base as usize;
    let mut i = 0;
    loop {
        let start = unsafe { block_offset_bytes(base, i) }.expect("pointer not within any block");
        let end =
            unsafe { block_offset_bytes(base, i + 1) }.unwrap_or(n_slabs as usize * SLAB_SIZE);
        if off >= start && off < end {
            return i;
        }
        i += 1;
    }
}

/// Insert a new offset entry for the block immediately after logical block
/// `after` (`after` in `0..=6`), shifting existing entries up by one slot.
/// Callers must ensure slot 7 is currently empty.
pub(crate) unsafe fn push_offset(base: *mut u8, after: usize, new_off: usize) {
    unsafe {
        let mut i = 7;
        while i > after + 1 {
            let v = wide::block_off_units(base, i - 1);
            wide::set_block_off_units(base, i, v);
            i -= 1;
        }
        wide::set_block_off_units(base, after + 1, (new_off / ALIGN) as u8);
    }
}

/// Remove the offset entry for logical block `after + 1`, shifting later
/// entries down by one slot and sliding `block_alloc` bits above it down to
/// close the gap.
pub(crate) unsafe fn remove_offset(base: *mut u8, after: usize) {
    unsafe {
        let mut i = after + 1;
        while i < 7 {
            let v = wide::block_off_units(base, i + 1);
            wide::set_block_off_units(base, i, v);
            i += 1;
        }
        wide::set_block_off_units(base, 7, 0);

        let bits = wide::block_alloc(base);
        let low_mask = (1u16 << (after + 1)) as u8 - 1;
        let keep_low = bits & low_mask;
        let high = bits >> (after + 2) << (after + 1);
        wide::set_block_alloc(base, keep_low | high);
    }
}

/// Install a new offset entry after logical block `after` at byte offset
/// `split_off`, then open a free bit slot for it by shifting the alloc bits
/// above `after` left by one (caller sets the new block's bit afterward).
pub(crate) unsafe fn split_block(base: *mut u8, after: usize, split_off: usize) {
    unsafe {
        push_offset(base, after, split_off);
        let bits = wide::block_alloc(base);
        let low_mask = (1u16 << (after + 1)) as u8 - 1;
        let keep_low = bits & low_mask;
        let high = (bits & !low_mask) << 1;
        wide::set_block_alloc(base, keep_low | high);
    }
}

/// Place a request of `req` bytes into logical block `idx` of `header`,
/// splitting off a free tail when the remainder is still a valid medium
/// block. Returns the (unchanged) block start address.
pub(crate) unsafe fn place_block<S: HeapSource>(
    heap: &mut Heap<S>,
    header: *mut u8,
    idx: usize,
    req: usize,
) -> *mut u8 {
    unsafe {
        let n_slabs = wide::size(header);
        let start = block_offset_bytes(header, idx).unwrap();
        let block_size = block_size_bytes(header, idx, n_slabs);
        if block_size - req >= MIN_MED {
            let tail_off = start + req;
            split_block(header, idx, tail_off);
            wide::set_block_alloc_bit(header, idx, true);
            let tail_size = block_size - req;
            heap.medium_bins.link(tail_size, header.add(tail_off));
        } else {
            wide::set_block_alloc_bit(header, idx, true);
        }
        header.add(start)
    }
}

unsafe fn init_wide_header(header: *mut u8) {
    unsafe {
        let mut f = slab::flags(header);
        f.remove(SlabFlags::PACKED);
        slab::set_flags(header, f);
        wide::set_size(header, 1);
        wide::set_block_alloc(header, 0);
        for i in 1..=7 {
            wide::set_block_off_units(header, i, 0);
        }
    }
}

unsafe fn grow_and_allocate<S: HeapSource>(heap: &mut Heap<S>, size: usize) -> *mut u8 {
    let header = unsafe { lifecycle::acquire_slabs(heap, 1) };
    if header.is_null() {
        return ptr::null_mut();
    }
    unsafe { init_wide_header(header) };
    trace!("medium: initialized fresh slab {:p}", header);
    unsafe { place_block(heap, header, 0, size) }
}

/// Top-level large allocate for a size strictly greater than `MAX_MED`:
/// acquire however many contiguous slabs are needed and carve block 0 from
/// the fresh run, same as the medium grow path but with `n_slabs > 1`.
pub unsafe fn allocate_large<S: HeapSource>(heap: &mut Heap<S>, size: usize) -> *mut u8 {
    let total = wide::FIRST_BLOCK_OFFSET + size;
    let n_slabs = config::ceil_div_pub(total, SLAB_SIZE) as u64;
    let header = unsafe { lifecycle::acquire_slabs(heap, n_slabs) };
    if header.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        init_wide_header(header);
        wide::set_size(header, n_slabs);
        place_block(heap, header, 0, size)
    }
}

/// Top-level medium allocate for an exact size already clamped to
/// `MIN_MED..=MAX_MED`.
pub unsafe fn allocate<S: HeapSource>(heap: &mut Heap<S>, size: usize) -> *mut u8 {
    let start_bin = config::medium_bin_index(size);
    let scan = heap
        .medium_bins
        .skiplist
        .scan_from(start_bin, config::NUM_MEDIUM_BINS);
    let mut found = None;
    for bin in scan {
        let head = heap.medium_bins.head(bin);
        if head.is_null() {
            heap.medium_bins.skiplist.clear(bin);
            continue;
        }
        found = Some((bin, head));
        break;
    }
    let Some((bin, payload)) = found else {
        return unsafe { grow_and_allocate(heap, size) };
    };
    let bin_size = config::medium_bin_size(bin);
    unsafe {
        heap.medium_bins.unlink(bin_size, payload);
        let header = slab::resolve_header(payload);
        let n_slabs = wide::size(header);
        let idx = find_block_index(header, payload, n_slabs);
        trace!("medium: first-fit bin {bin} -> header {:p} block {idx}", header);
        place_block(heap, header, idx, size)
    }
}

/// Release a medium/large block at `payload` whose run header is `header`.
pub unsafe fn release<S: HeapSource>(heap: &mut Heap<S>, header: *mut u8, payload: *mut u8) {
    unsafe {
        let n_slabs = wide::size(header);
        let mut idx = find_block_index(header, payload, n_slabs);
        let end0 = block_offset_bytes(header, idx + 1).unwrap_or(n_slabs as usize * SLAB_SIZE);
        if end0 > SLAB_SIZE {
            // This block spans beyond the first slab: return its remainder
            // slabs directly and clamp the run to one slab before any
            // coalescing.
            lifecycle::release_remainder_slabs(heap, header.add(SLAB_SIZE), n_slabs - 1);
            wide::set_size(header, 1);
        }
        wide::set_block_alloc_bit(header, idx, false);

        if idx > 0 && !wide::block_alloc_bit(header, idx - 1) {
            let left_size = block_size_bytes(header, idx - 1, wide::size(header));
            let left_start = block_offset_bytes(header, idx - 1).unwrap();
            heap.medium_bins.unlink(left_size, header.add(left_start));
            remove_offset(header, idx - 1);
            idx -= 1;
        }
        if let Some(right_start) = block_offset_bytes(header, idx + 1) {
            if !wide::block_alloc_bit(header, idx + 1) {
                let right_size = block_size_bytes(header, idx + 1, wide::size(header));
                heap.medium_bins.unlink(right_size, header.add(right_start));
                remove_offset(header, idx);
            }
        }

        if wide::block_alloc(header) == 0 {
            let n = wide::size(header);
            trace!("medium: run at {:p} fully free, releasing {n} slab(s)", header);
            lifecycle::release_slabs(heap, header, n);
            return;
        }

        let mut final_size = block_size_bytes(header, idx, wide::size(header));
        if final_size < MIN_MED {
            // Only reachable when the trailing remainder of a shrunk large
            // block is too small to stand alone as a medium block.
            debug_assert!(idx > 0);
            let prev_alloc = wide::block_alloc_bit(header, idx - 1);
            if !prev_alloc {
                let prev_size = block_size_bytes(header, idx - 1, wide::size(header));
                let prev_start = block_offset_bytes(header, idx - 1).unwrap();
                heap.medium_bins.unlink(prev_size, header.add(prev_start));
            }
            remove_offset(header, idx - 1);
            idx -= 1;
            if !prev_alloc {
                final_size = block_size_bytes(header, idx, wide::size(header));
                let start = block_offset_bytes(header, idx).unwrap();
                heap.medium_bins.link(final_size, header.add(start));
            }
            // else: silently absorbed as deadweight into the live preceding block.
        } else {
            let start = block_offset_bytes(header, idx).unwrap();
            heap.medium_bins.link(final_size, header.add(start));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_MED;
    use crate::heap::Heap;
    use crate::heap_source::SystemHeapSource;

    fn test_heap() -> Heap<SystemHeapSource> {
        Heap::new(SystemHeapSource::with_capacity(4 * 1024 * 1024))
    }

    #[test]
    fn allocating_a_medium_block_splits_off_a_free_tail() {
        let mut heap = test_heap();
        let p = heap.allocate(600);
        assert!(!p.is_null());
        let header = unsafe { crate::slab::resolve_header(p) };
        let n_slabs = unsafe { super::wide::size(header) };
        assert_eq!(n_slabs, 1);
        // Block 0 is live, and since 4080 - 600 - 16(header) leaves well over
        // MIN_MED, a free tail block should have been split off.
        assert!(unsafe { super::wide::block_alloc_bit(header, 0) });
        assert!(!unsafe { super::wide::block_alloc_bit(header, 1) });
    }

    #[test]
    fn releasing_a_medium_block_coalesces_with_a_free_neighbor() {
        let mut heap = test_heap();
        let a = heap.allocate(600);
        let b = heap.allocate(600);
        assert!(!a.is_null() && !b.is_null());
        let header = unsafe { crate::slab::resolve_header(a) };
        heap.release(a);
        // `a`'s slot is free again and should have merged with whatever free
        // tail followed it before `b` was carved out, unless `b` claimed the
        // whole remainder exactly.
        assert!(!unsafe { super::wide::block_alloc_bit(header, 0) });
        heap.release(b);
        // Fully free again: the whole run goes back to the slab-bin pool.
        assert!(unsafe { crate::slab::is_free(header) });
    }

    #[test]
    fn a_block_too_small_to_split_is_taken_whole() {
        let mut heap = test_heap();
        // MAX_MED - MIN_MED leaves no room for a further MIN_MED-sized tail.
        let p = heap.allocate(crate::config::MAX_MED - MIN_MED + 1);
        assert!(!p.is_null());
        let header = unsafe { crate::slab::resolve_header(p) };
        assert!(unsafe { super::wide::block_alloc_bit(header, 0) });
        assert!(unsafe { block_offset_bytes(header, 1) }.is_none());
    }

    #[test]
    fn large_allocation_spans_multiple_slabs_and_frees_cleanly() {
        let mut heap = test_heap();
        let p = heap.allocate(4096);
        assert!(!p.is_null());
        let header = unsafe { crate::slab::resolve_header(p) };
        assert_eq!(unsafe { super::wide::size(header) }, 2);
        heap.release(p);
        assert!(unsafe { crate::slab::is_free(header) });
    }
}
