//! The sbrk-style heap-extension collaborator.
//!
//! The allocation algorithms in this crate never grow memory themselves;
//! they ask a [`HeapSource`] for more slabs and only ever receive back a
//! page-aligned, monotonically-growing region. Keeping that primitive
//! behind a trait lets the allocator stay agnostic about where memory
//! actually comes from, while still giving the crate something real to
//! call so it is usable and testable standalone.

use crate::config::SLAB_SIZE;
use core::ptr;

/// Failure sentinel returned by [`HeapSource::extend_heap`] on exhaustion.
pub const EXTEND_FAILED: *mut u8 = ptr::null_mut();

/// Abstraction over "grow the owned heap region by `bytes`, return a
/// page-aligned pointer to the new region."
///
/// `bytes` is always an exact multiple of [`SLAB_SIZE`]. Implementations
/// must return a pointer aligned to `SLAB_SIZE`, contiguous with every prior
/// extension, and must never be interleaved with allocator state mutation.
pub trait HeapSource {
    /// Extend the heap by `bytes`, or return [`EXTEND_FAILED`].
    fn extend_heap(&mut self, bytes: usize) -> *mut u8;
}

/// A `HeapSource` backed by one large arena carved out of the host
/// allocator up front. Slabs are handed out as monotonically increasing
/// sub-ranges of that arena; memory is never returned to the host — a
/// deliberate choice to keep the growth-only contract simple rather than
/// plumbing munmap-style shrink-back through every caller.
///
/// This is the in-scope, testable stand-in for whatever sbrk-style
/// primitive an embedding environment would otherwise supply.
pub struct SystemHeapSource {
    arena: *mut u8,
    arena_layout: core::alloc::Layout,
    capacity: usize,
    used: usize,
}

// SAFETY: the arena is an owned heap allocation; `SystemHeapSource` is not
// `Sync` or `Send` and is only ever touched behind the allocator's own lock.
unsafe impl Send for SystemHeapSource {}

impl SystemHeapSource {
    /// Reserve `capacity` bytes (rounded up to a multiple of `SLAB_SIZE`)
    /// up front. Extensions beyond `capacity` fail with [`EXTEND_FAILED`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = (capacity + SLAB_SIZE - 1) / SLAB_SIZE * SLAB_SIZE;
        let layout = core::alloc::Layout::from_size_align(capacity.max(SLAB_SIZE), SLAB_SIZE)
            .expect("arena layout must be valid");
        let arena = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!arena.is_null(), "failed to reserve allocator arena");
        Self {
            arena,
            arena_layout: layout,
            capacity: layout.size(),
            used: 0,
        }
    }

    /// Default arena size used by [`Default`] and by the process-wide
    /// singleton: 256 MiB, generous for the hosted test harness.
    pub const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;
}

impl Default for SystemHeapSource {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl Drop for SystemHeapSource {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.arena, self.arena_layout) };
    }
}

impl HeapSource for SystemHeapSource {
    fn extend_heap(&mut self, bytes: usize) -> *mut u8 {
        debug_assert_eq!(bytes % SLAB_SIZE, 0);
        if self.used + bytes > self.capacity {
            return EXTEND_FAILED;
        }
        let ptr = unsafe { self.arena.add(self.used) };
        self.used += bytes;
        ptr
    }
}

/// Test-only [`HeapSource`] wrapper that fails every extension past a fixed
/// byte budget, used to exercise the out-of-memory path and the
/// failure-atomicity property.
#[cfg(test)]
pub struct FailingHeapSource {
    inner: SystemHeapSource,
    budget: usize,
    granted: usize,
}

#[cfg(test)]
impl FailingHeapSource {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: SystemHeapSource::default(),
            budget,
            granted: 0,
        }
    }
}

#[cfg(test)]
impl HeapSource for FailingHeapSource {
    fn extend_heap(&mut self, bytes: usize) -> *mut u8 {
        if self.granted + bytes > self.budget {
            return EXTEND_FAILED;
        }
        let ptr = self.inner.extend_heap(bytes);
        if !ptr.is_null() {
            self.granted += bytes;
        }
        ptr
    }
}
