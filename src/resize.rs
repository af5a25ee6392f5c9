//! Resize policy: in-place extend, in-place shrink, or forced
//! allocate/copy/release migration.

use crate::config::{self, ALIGN, MAX_MED, MIN_MED, SLAB_SIZE};
use crate::heap::Heap;
use crate::heap_source::HeapSource;
use crate::lifecycle;
use crate::medium;
use crate::slab::{self, free_region, wide, SlabFlags};
use core::ptr;
use log::trace;

/// Deadweight budget for in-place extend/shrink.
const DEADWEIGHT_LIMIT: usize = 496;

fn slab_round_up(bytes: usize) -> usize {
    (bytes + SLAB_SIZE - 1) / SLAB_SIZE * SLAB_SIZE
}

/// Allocate fresh, copy `min(new_size, old_capacity)` bytes, release the old
/// pointer, and return the new one. The old block is only released once the
/// new allocation has succeeded — on OOM the caller keeps using the
/// original pointer.
unsafe fn migrate<S: HeapSource>(
    heap: &mut Heap<S>,
    old_ptr: *mut u8,
    old_capacity: usize,
    new_size: usize,
) -> *mut u8 {
    let new_ptr = unsafe { crate::heap::allocate_inner(heap, new_size) };
    if new_ptr.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        ptr::copy_nonoverlapping(old_ptr, new_ptr, new_size.min(old_capacity));
        crate::heap::release_inner(heap, old_ptr);
    }
    new_ptr
}

pub unsafe fn resize<S: HeapSource>(heap: &mut Heap<S>, ptr: *mut u8, new_size: usize) -> *mut u8 {
    let aligned = (new_size + ALIGN - 1) / ALIGN * ALIGN;
    let base = unsafe { slab::slab_base(ptr as usize) as *mut u8 };
    if unsafe { slab::is_packed(base) } {
        unsafe { resize_packed(heap, ptr, base, aligned) }
    } else {
        let header = unsafe { slab::resolve_header(base) };
        unsafe { resize_wide(heap, ptr, header, aligned) }
    }
}

unsafe fn resize_packed<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    base: *mut u8,
    new_size: usize,
) -> *mut u8 {
    let k = unsafe { crate::slab::packed::sz_class(base) };
    let block_size = config::size_class_to_block_size(k);
    if new_size > 0 && new_size <= config::MAX_TINY && config::adj_tiny(new_size) == block_size {
        return ptr;
    }
    unsafe { migrate(heap, ptr, block_size, new_size) }
}

unsafe fn resize_wide<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    header: *mut u8,
    new_size: usize,
) -> *mut u8 {
    unsafe {
        let n_slabs = wide::size(header);
        let idx = medium::find_block_index(header, ptr, n_slabs);
        let bsz = medium::block_size_bytes(header, idx, n_slabs);

        if new_size < MIN_MED {
            return migrate(heap, ptr, bsz, new_size);
        }

        if bsz >= SLAB_SIZE {
            if new_size > bsz {
                resize_large_extend(heap, ptr, header, n_slabs, bsz, new_size)
            } else {
                resize_large_shrink(heap, ptr, header, n_slabs, idx, bsz, new_size)
            }
        } else if new_size > MAX_MED {
            migrate(heap, ptr, bsz, new_size)
        } else if new_size <= bsz {
            resize_medium_shrink(heap, ptr, header, idx, bsz, new_size)
        } else {
            resize_medium_extend(heap, ptr, header, idx, bsz, new_size)
        }
    }
}

unsafe fn resize_large_extend<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    header: *mut u8,
    n_slabs: u64,
    bsz: usize,
    new_size: usize,
) -> *mut u8 {
    let remainder = new_size - bsz;
    let slab_rounded = slab_round_up(remainder);
    let deadweight = slab_rounded - remainder;
    if deadweight > DEADWEIGHT_LIMIT {
        return unsafe { migrate(heap, ptr, bsz, new_size) };
    }
    let slabs_needed = (slab_rounded / SLAB_SIZE) as u64;
    let next = unsafe { header.add((n_slabs * SLAB_SIZE as u64) as usize) };

    if next as usize >= heap.heap_end as usize {
        let bytes = (slabs_needed * SLAB_SIZE as u64) as usize;
        let grown = heap.heap_source.extend_heap(bytes);
        if grown.is_null() {
            return unsafe { migrate(heap, ptr, bsz, new_size) };
        }
        heap.heap_end = unsafe { heap.heap_end.add(bytes) };
        unsafe { mark_continuations(header, n_slabs, slabs_needed) };
        unsafe { wide::set_size(header, n_slabs + slabs_needed) };
        trace!("resize: grew large block at {:p} by {slabs_needed} slab(s)", header);
        return ptr;
    }

    if unsafe { slab::is_free(next) } {
        let avail = unsafe { free_region::n_slabs(next) };
        if avail >= slabs_needed {
            unsafe { heap.slab_bins.unlink(next, avail) };
            if avail > slabs_needed {
                let tail = unsafe { next.add((slabs_needed * SLAB_SIZE as u64) as usize) };
                let tail_n = avail - slabs_needed;
                unsafe {
                    slab::set_flags(tail, SlabFlags::PREV_ALLOC);
                    free_region::set_n_slabs(tail, tail_n);
                    free_region::write_footer(tail, tail_n);
                    heap.slab_bins.link(tail, tail_n);
                }
            } else {
                let after = unsafe { next.add((avail * SLAB_SIZE as u64) as usize) };
                if after as usize >= heap.heap_end as usize {
                    heap.last_slab_alloc = true;
                } else {
                    unsafe { slab::set_prev_alloc_bit(after, true) };
                }
            }
            unsafe { mark_continuations(header, n_slabs, slabs_needed) };
            unsafe { wide::set_size(header, n_slabs + slabs_needed) };
            trace!("resize: consumed free neighbor into large block at {:p}", header);
            return ptr;
        }
    }

    unsafe { migrate(heap, ptr, bsz, new_size) }
}

unsafe fn mark_continuations(header: *mut u8, old_n_slabs: u64, added: u64) {
    unsafe {
        let mut s = header.add((old_n_slabs * SLAB_SIZE as u64) as usize);
        for _ in 0..added {
            slab::continuation::mark(s, header);
            s = s.add(SLAB_SIZE);
        }
    }
}

unsafe fn resize_large_shrink<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    header: *mut u8,
    n_slabs: u64,
    idx: usize,
    bsz: usize,
    new_size: usize,
) -> *mut u8 {
    let hangover = bsz % SLAB_SIZE;
    if new_size <= hangover {
        unsafe { lifecycle::release_remainder_slabs(heap, header.add(SLAB_SIZE), n_slabs - 1) };
        unsafe { wide::set_size(header, 1) };
        if hangover - new_size >= MIN_MED {
            let start = unsafe { medium::block_offset_bytes(header, idx) }.unwrap();
            let tail_off = start + new_size;
            unsafe {
                medium::split_block(header, idx, tail_off);
                wide::set_block_alloc_bit(header, idx, true);
                heap.medium_bins.link(hangover - new_size, header.add(tail_off));
            }
        }
        trace!("resize: shrank large block at {:p} to a medium block", header);
        return ptr;
    }

    let diff = bsz - new_size;
    let trailing_slabs = (diff / SLAB_SIZE) as u64;
    let dw = diff % SLAB_SIZE;
    if dw <= DEADWEIGHT_LIMIT {
        if trailing_slabs > 0 {
            let freed_base = unsafe { header.add(((n_slabs - trailing_slabs) * SLAB_SIZE as u64) as usize) };
            unsafe { lifecycle::release_remainder_slabs(heap, freed_base, trailing_slabs) };
            unsafe { wide::set_size(header, n_slabs - trailing_slabs) };
        }
        return ptr;
    }
    if diff > DEADWEIGHT_LIMIT {
        return unsafe { migrate(heap, ptr, bsz, new_size) };
    }
    ptr
}

unsafe fn resize_medium_shrink<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    header: *mut u8,
    idx: usize,
    bsz: usize,
    new_size: usize,
) -> *mut u8 {
    unsafe {
        if let Some(right_start) = medium::block_offset_bytes(header, idx + 1) {
            if !wide::block_alloc_bit(header, idx + 1) {
                let n_slabs = wide::size(header);
                let right_size = medium::block_size_bytes(header, idx + 1, n_slabs);
                heap.medium_bins.unlink(right_size, header.add(right_start));
                let new_right_start = medium::block_offset_bytes(header, idx).unwrap() + new_size;
                wide::set_block_off_units(header, idx + 1, (new_right_start / ALIGN) as u8);
                let new_right_size = right_start + right_size - new_right_start;
                heap.medium_bins.link(new_right_size, header.add(new_right_start));
                return ptr;
            }
        }
        if bsz - new_size >= MIN_MED {
            medium::place_block(heap, header, idx, new_size);
            return ptr;
        }
        ptr
    }
}

unsafe fn resize_medium_extend<S: HeapSource>(
    heap: &mut Heap<S>,
    ptr: *mut u8,
    header: *mut u8,
    idx: usize,
    bsz: usize,
    new_size: usize,
) -> *mut u8 {
    unsafe {
        let needed = new_size - bsz;
        if let Some(right_start) = medium::block_offset_bytes(header, idx + 1) {
            if !wide::block_alloc_bit(header, idx + 1) {
                let n_slabs = wide::size(header);
                let right_size = medium::block_size_bytes(header, idx + 1, n_slabs);
                if right_size >= needed {
                    heap.medium_bins.unlink(right_size, header.add(right_start));
                    let leftover = right_size - needed;
                    if leftover < MIN_MED {
                        medium::remove_offset(header, idx);
                    } else {
                        let new_right_start = right_start + needed;
                        wide::set_block_off_units(header, idx + 1, (new_right_start / ALIGN) as u8);
                        heap.medium_bins.link(leftover, header.add(new_right_start));
                    }
                    return ptr;
                }
            }
        }
        migrate(heap, ptr, bsz, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_source::SystemHeapSource;

    fn test_heap() -> Heap<SystemHeapSource> {
        Heap::new(SystemHeapSource::with_capacity(4 * 1024 * 1024))
    }

    #[test]
    fn resizing_to_the_same_aligned_size_returns_the_same_pointer() {
        let mut heap = test_heap();
        let p = heap.allocate(2000);
        assert!(!p.is_null());
        let q = heap.resize(p, 2000);
        assert_eq!(p, q);
    }

    /// Growing into a free right neighbor resizes in place.
    #[test]
    fn extending_into_a_free_right_neighbor_resizes_in_place() {
        let mut heap = test_heap();
        let p = heap.allocate(2000);
        assert!(!p.is_null());
        let q = heap.resize(p, 3000);
        assert_eq!(q, p);
        let header = unsafe { slab::resolve_header(p) };
        let idx = unsafe { medium::find_block_index(header, p, wide::size(header)) };
        let size = unsafe { medium::block_size_bytes(header, idx, wide::size(header)) };
        assert_eq!(size, 3008);
    }

    /// Without a free right neighbor, growth past the block's capacity must
    /// migrate to a new pointer.
    #[test]
    fn growing_past_a_full_slab_migrates() {
        let mut heap = test_heap();
        let p = heap.allocate(2000);
        // Claims the rest of the slab, leaving no free neighbor for `p`.
        let _q = heap.allocate(2000);
        let r = heap.resize(p, 3000);
        assert!(!r.is_null());
        assert_ne!(r, p);
    }

    #[test]
    fn shrinking_a_medium_block_with_a_free_right_neighbor_grows_the_neighbor() {
        let mut heap = test_heap();
        let p = heap.allocate(2000);
        assert!(!p.is_null());
        let q = heap.resize(p, 1008);
        assert_eq!(q, p);
        let header = unsafe { slab::resolve_header(p) };
        let idx = unsafe { medium::find_block_index(header, p, wide::size(header)) };
        let size = unsafe { medium::block_size_bytes(header, idx, wide::size(header)) };
        assert_eq!(size, 1008);
    }

    #[test]
    fn extending_a_large_block_past_the_heap_end_grows_the_heap() {
        let mut heap = test_heap();
        let p = heap.allocate(4096);
        assert!(!p.is_null());
        let before_end = heap.heap_end();
        let q = heap.resize(p, 12176);
        assert_eq!(q, p);
        assert!(heap.heap_end() as usize > before_end as usize);
    }
}

