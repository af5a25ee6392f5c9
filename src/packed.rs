//! Packed (tiny) slab engine: bitmap-tracked equal-size blocks inside a
//! single slab.

use crate::config::{self, ALIGN, TWO_LEVEL_THRESHOLD};
use crate::heap::Heap;
use crate::heap_source::HeapSource;
use crate::lifecycle;
use crate::slab::{self, packed, SlabFlags};
use core::ptr;
use log::trace;

fn size_class_of(block_size: usize) -> u8 {
    (block_size / ALIGN - 1) as u8
}

fn header_len(block_size: usize) -> usize {
    if packed::is_two_level(block_size) {
        config::two_level_layout(block_size).1
    } else {
        crate::config::WIDE_HEADER
    }
}

/// Top-level tiny allocate: find or create a slab for `adj_size` and hand
/// out a block.
pub unsafe fn allocate<S: HeapSource>(heap: &mut Heap<S>, adj_size: usize) -> *mut u8 {
    let bin = heap.small_bins.bin_for_size(adj_size);
    let head = heap.small_bins.head(bin);
    if !head.is_null() {
        return unsafe { allocate_in_slab(heap, head, adj_size, bin) };
    }
    unsafe { init_fresh_slab(heap, adj_size, bin) }
}

unsafe fn init_fresh_slab<S: HeapSource>(heap: &mut Heap<S>, block_size: usize, bin: usize) -> *mut u8 {
    let base = unsafe { lifecycle::acquire_slabs(heap, 1) };
    if base.is_null() {
        return ptr::null_mut();
    }
    let two_level = packed::is_two_level(block_size);
    let k = size_class_of(block_size);
    unsafe {
        let mut f = SlabFlags::ALLOC | SlabFlags::PACKED;
        f.set(SlabFlags::PREV_ALLOC, slab::flags(base).contains(SlabFlags::PREV_ALLOC));
        slab::set_flags(base, f);
        packed::set_sz_class(base, k);
        packed::set_alloc_count(base, 1);

        if two_level {
            let (n_blocks, _block_start, l2_bytes, _l1_bytes) = config::two_level_layout(block_size);
            // All blocks start free, then block 0 is claimed below.
            init_two_level_bitmap(base, n_blocks, l2_bytes);
            clear_two_level_bit(base, 0, l2_bytes);
        } else {
            let n_blocks = config::flat_layout(block_size);
            let full = if n_blocks == 64 { u64::MAX } else { (1u64 << n_blocks) - 1 };
            packed::set_flat_bitmap(base, full & !1);
        }
    }
    trace!("packed: initialized fresh slab {:p} for block size {block_size}", base);

    if still_has_free(base, block_size) {
        unsafe { heap.small_bins.link(bin, base) };
    }
    unsafe { packed::block_ptr(base, header_len(block_size), block_size, 0) }
}

unsafe fn init_two_level_bitmap(base: *mut u8, n_blocks: usize, l2_bytes: usize) {
    unsafe {
        let l2 = packed::level2_ptr(base);
        let full_bytes = n_blocks / 8;
        for i in 0..full_bytes {
            l2.add(i).write(0xFF);
        }
        let rem = n_blocks % 8;
        if rem != 0 {
            l2.add(full_bytes).write((1u8 << rem) - 1);
        }
        for i in (full_bytes + (rem != 0) as usize)..l2_bytes {
            l2.add(i).write(0);
        }
        let groups = config::ceil_div_pub(n_blocks, 16);
        let level1 = if groups >= 16 { 0xFFFFu16 } else { (1u16 << groups) - 1 };
        packed::set_level1(base, level1);
    }
}

fn still_has_free(base: *mut u8, block_size: usize) -> bool {
    unsafe {
        if packed::is_two_level(block_size) {
            packed::level1(base) != 0
        } else {
            packed::flat_bitmap(base) != 0
        }
    }
}

unsafe fn clear_two_level_bit(base: *mut u8, idx: usize, _l2_bytes: usize) {
    unsafe {
        let group = idx / 16;
        let bit_in_group = idx % 16;
        let byte_idx = bit_in_group / 8;
        let bit_in_byte = bit_in_group % 8;
        let l2 = packed::level2_ptr(base);
        let byte_off = group * 2 + byte_idx;
        let byte = l2.add(byte_off).read();
        let new_byte = byte & !(1 << bit_in_byte);
        l2.add(byte_off).write(new_byte);
        let group_byte_off = group * 2;
        let group_word = (l2.add(group_byte_off).read() as u16)
            | ((l2.add(group_byte_off + 1).read() as u16) << 8);
        if group_word == 0 {
            let l1 = packed::level1(base) & !(1 << group);
            packed::set_level1(base, l1);
        }
    }
}

unsafe fn set_two_level_bit(base: *mut u8, idx: usize) {
    unsafe {
        let group = idx / 16;
        let bit_in_group = idx % 16;
        let byte_idx = bit_in_group / 8;
        let bit_in_byte = bit_in_group % 8;
        let l2 = packed::level2_ptr(base);
        let byte_off = group * 2 + byte_idx;
        let byte = l2.add(byte_off).read();
        l2.add(byte_off).write(byte | (1 << bit_in_byte));
        packed::set_level1(base, packed::level1(base) | (1 << group));
    }
}

/// Find the lowest set bit of a two-level bitmap's level-2, returning the
/// global block index.
unsafe fn find_free_two_level(base: *mut u8) -> usize {
    unsafe {
        let level1 = packed::level1(base);
        let group = level1.trailing_zeros() as usize;
        let l2 = packed::level2_ptr(base);
        let byte_off = group * 2;
        let word = (l2.add(byte_off).read() as u16) | ((l2.add(byte_off + 1).read() as u16) << 8);
        let bit = word.trailing_zeros() as usize;
        group * 16 + bit
    }
}

unsafe fn allocate_in_slab<S: HeapSource>(
    heap: &mut Heap<S>,
    base: *mut u8,
    block_size: usize,
    bin: usize,
) -> *mut u8 {
    let two_level = packed::is_two_level(block_size);
    let idx = unsafe {
        if two_level {
            find_free_two_level(base)
        } else {
            packed::flat_bitmap(base).trailing_zeros() as usize
        }
    };
    unsafe {
        if two_level {
            clear_two_level_bit(base, idx, 0);
        } else {
            let bm = packed::flat_bitmap(base);
            packed::set_flat_bitmap(base, bm & !(1 << idx));
        }
        packed::set_alloc_count(base, packed::alloc_count(base) + 1);

        if !still_has_free(base, block_size) {
            heap.small_bins.unlink(bin, base);
        }
        packed::block_ptr(base, header_len(block_size), block_size, idx)
    }
}

/// Release a tiny pointer. `base` is its packed slab.
pub unsafe fn release<S: HeapSource>(heap: &mut Heap<S>, base: *mut u8, ptr: *mut u8) {
    let k = unsafe { packed::sz_class(base) };
    let block_size = config::size_class_to_block_size(k);
    let two_level = packed::is_two_level(block_size);
    let header = header_len(block_size);
    let idx = (ptr as usize - base as usize - header) / block_size;
    let small_bin = heap.small_bins.bin_for_size(block_size);

    let was_empty = !still_has_free(base, block_size);
    unsafe {
        if two_level {
            set_two_level_bit(base, idx);
        } else {
            let bm = packed::flat_bitmap(base);
            packed::set_flat_bitmap(base, bm | (1 << idx));
        }
    }
    if was_empty {
        unsafe { heap.small_bins.link(small_bin, base) };
    }

    let remaining = unsafe { packed::alloc_count(base) - 1 };
    unsafe { packed::set_alloc_count(base, remaining) };
    trace!("packed: released block {idx} in slab {:p}, {remaining} left", base);

    if remaining == 0 {
        unsafe {
            heap.small_bins.unlink(small_bin, base);
            lifecycle::release_slabs(heap, base, 1);
        }
    }
}
