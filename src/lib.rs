//! A segregated slab allocator with three size regimes — tiny (packed
//! bitmap slabs), medium (offset-table slabs), and large (multi-slab runs)
//! — over a monotonically growing, page-aligned heap.
//!
//! The crate is built for a hosted single-threaded test harness rather than
//! a kernel: [`heap_source::SystemHeapSource`] carves its arena out of the
//! host allocator instead of a real `sbrk`, which is why this crate is a
//! plain `std` crate rather than `no_std` (see DESIGN.md). The allocator
//! core itself (`config`, `slab`, `bins`, `packed`, `medium`, `lifecycle`,
//! `resize`) never touches `std` beyond `core::ptr`/`core::fmt`.
//!
//! The four public entry points mirror a classical C allocator interface:
//! [`allocate`], [`release`], [`resize`], [`zero_allocate`]. They delegate
//! to a process-wide [`Heap`] singleton reached through [`global`], but the
//! type is also usable directly for embedding or testing against a
//! non-global heap.

pub mod bins;
pub mod checker;
pub mod config;
pub mod error;
pub mod heap;
pub mod heap_source;
pub mod lifecycle;
pub mod medium;
pub mod packed;
pub mod resize;
pub mod slab;

pub use error::ConsistencyError;
pub use heap::{allocate, global, release, resize, zero_allocate, Heap};
pub use heap_source::{HeapSource, SystemHeapSource, EXTEND_FAILED};
