//! Top-level dispatch: route a request to the correct regime and own the
//! process-wide heap state.

use crate::bins::{MediumBins, SlabBins, SmallBins};
use crate::config::{self, ALIGN, MAX_MED, MAX_TINY};
use crate::heap_source::{HeapSource, SystemHeapSource};
use crate::medium;
use crate::packed;
use crate::resize;
use crate::slab;
use core::ptr;
use log::warn;
use spin::{Mutex, Once};

/// Process-wide allocator state: the segregated bins, skiplists, and the
/// monotonically growing heap region backing them.
pub struct Heap<S: HeapSource> {
    pub(crate) slab_bins: SlabBins,
    pub(crate) small_bins: SmallBins,
    pub(crate) medium_bins: MediumBins,
    pub(crate) heap_source: S,
    pub(crate) heap_start: *mut u8,
    pub(crate) heap_end: *mut u8,
    pub(crate) last_slab_alloc: bool,
}

// Not actually thread-safe; `Send` is implemented
// only so the global singleton can live behind a `spin::Mutex` without
// requiring real concurrent access.
unsafe impl<S: HeapSource + Send> Send for Heap<S> {}

impl<S: HeapSource> Heap<S> {
    pub fn new(heap_source: S) -> Self {
        Self {
            slab_bins: SlabBins::new(),
            small_bins: SmallBins::new(),
            medium_bins: MediumBins::new(),
            heap_source,
            heap_start: ptr::null_mut(),
            heap_end: ptr::null_mut(),
            last_slab_alloc: true,
        }
    }

    /// One-past-the-last byte currently owned, or null if nothing has been
    /// acquired yet.
    pub fn heap_end(&self) -> *mut u8 {
        self.heap_end
    }

    pub fn heap_start(&self) -> *mut u8 {
        self.heap_start
    }

    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let p = unsafe { allocate_inner(self, size) };
        self.debug_check();
        p
    }

    pub fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        unsafe { release_inner(self, ptr) }
        self.debug_check();
    }

    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.release(ptr);
            return ptr::null_mut();
        }
        let p = unsafe { resize::resize(self, ptr, size) };
        self.debug_check();
        p
    }

    /// Allocate `n * size` bytes and zero them. Matches the classical
    /// `calloc` contract literally: overflow of `n * size` is the caller's
    /// concern.
    pub fn zero_allocate(&mut self, n: usize, size: usize) -> *mut u8 {
        let total = n.wrapping_mul(size);
        let p = self.allocate(total);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Run the consistency checker after a public mutation, but only in
    /// debug builds with the `checker` feature on (default). Never part of
    /// the release-build four-function contract.
    #[cfg(all(debug_assertions, feature = "checker"))]
    fn debug_check(&self) {
        if let Err(e) = crate::checker::check(self) {
            panic!("heap consistency check failed: {e}");
        }
    }

    #[cfg(not(all(debug_assertions, feature = "checker")))]
    #[inline(always)]
    fn debug_check(&self) {}
}

/// Align `size` up to [`ALIGN`], routing zero through the caller.
fn align_request(size: usize) -> usize {
    (size + ALIGN - 1) / ALIGN * ALIGN
}

pub(crate) unsafe fn allocate_inner<S: HeapSource>(heap: &mut Heap<S>, size: usize) -> *mut u8 {
    let aligned = align_request(size);
    let p = if aligned <= MAX_TINY {
        let adj = config::adj_tiny(aligned);
        unsafe { packed::allocate(heap, adj) }
    } else if aligned <= MAX_MED {
        unsafe { medium::allocate(heap, aligned) }
    } else {
        unsafe { medium::allocate_large(heap, aligned) }
    };
    if p.is_null() {
        warn!("heap: out of memory requesting {size} bytes");
    }
    p
}

pub(crate) unsafe fn release_inner<S: HeapSource>(heap: &mut Heap<S>, ptr: *mut u8) {
    let base = unsafe { slab::slab_base(ptr as usize) as *mut u8 };
    unsafe {
        if slab::is_packed(base) {
            packed::release(heap, base, ptr);
        } else {
            let header = slab::resolve_header(base);
            medium::release(heap, header, ptr);
        }
    }
}

static GLOBAL: Once<Mutex<Heap<SystemHeapSource>>> = Once::new();

/// The process-wide heap singleton, built lazily on first use.
pub fn global() -> &'static Mutex<Heap<SystemHeapSource>> {
    GLOBAL.call_once(|| Mutex::new(Heap::new(SystemHeapSource::default())))
}

pub fn allocate(size: usize) -> *mut u8 {
    global().lock().allocate(size)
}

pub fn release(ptr: *mut u8) {
    global().lock().release(ptr)
}

pub fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    global().lock().resize(ptr, size)
}

pub fn zero_allocate(n: usize, size: usize) -> *mut u8 {
    global().lock().zero_allocate(n, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap<SystemHeapSource> {
        Heap::new(SystemHeapSource::with_capacity(4 * 1024 * 1024))
    }

    #[test]
    fn allocate_zero_bytes_returns_null() {
        let mut heap = test_heap();
        assert!(heap.allocate(0).is_null());
    }

    #[test]
    fn releasing_null_is_a_no_op() {
        let mut heap = test_heap();
        heap.release(ptr::null_mut());
    }

    #[test]
    fn resize_of_null_behaves_like_allocate() {
        let mut heap = test_heap();
        let p = heap.resize(ptr::null_mut(), 32);
        assert!(!p.is_null());
    }

    #[test]
    fn resize_to_zero_behaves_like_release() {
        let mut heap = test_heap();
        let p = heap.allocate(32);
        assert!(!p.is_null());
        let q = heap.resize(p, 0);
        assert!(q.is_null());
    }

    #[test]
    fn zero_allocate_zeroes_the_returned_buffer() {
        let mut heap = test_heap();
        let p = heap.allocate(64);
        unsafe { ptr::write_bytes(p, 0xAB, 64) };
        heap.release(p);
        let q = heap.zero_allocate(4, 16);
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    /// A failed allocation leaves the heap usable, rather than corrupting
    /// bin state.
    #[test]
    fn allocate_returns_null_on_exhaustion_without_corrupting_state() {
        use crate::heap_source::FailingHeapSource;
        let mut heap = Heap::new(FailingHeapSource::with_budget(config::SLAB_SIZE));
        let p = heap.allocate(16);
        assert!(!p.is_null());
        // Budget exhausted: a request that needs a fresh slab must fail cleanly.
        let q = heap.allocate(4096);
        assert!(q.is_null());
        // The heap is still usable: the first slab still has free packed blocks.
        let r = heap.allocate(16);
        assert!(!r.is_null());
    }

    #[test]
    fn tiny_medium_and_large_allocations_all_round_trip() {
        let mut heap = test_heap();
        let tiny = heap.allocate(16);
        let medium = heap.allocate(600);
        let large = heap.allocate(4096);
        assert!(!tiny.is_null() && !medium.is_null() && !large.is_null());
        heap.release(tiny);
        heap.release(medium);
        heap.release(large);
    }
}
