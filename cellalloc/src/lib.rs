//! Concurrent size-segregated object allocator for a garbage-collected heap
//!
//! Objects are carved out of pages of 8-byte cells:
//!
//! * up to 128 cells: [small pages](pages::SmallPage) of fixed-size blocks,
//!   one pool per block size
//! * up to almost a whole page: [medium pages](pages::MediumPage)
//!   of variable-size blocks
//! * anything bigger: a [large page](pages::LargePage) of its own
//!
//! Each mutator thread allocates through an
//! [allocator::ThreadShard], which keeps a page per size class to itself.
//! Pages move between the lock-free stacks of their [page_store::PageStore]
//! as they are handed out, marked for sweeping, swept, and freed.
//! The collector is only consulted (through [gc_api::GcApi]) while sweeping.

/// Size in bytes of a cell, the unit of all allocation
pub const CELL_SIZE: usize = 8;

pub mod allocator;
pub mod gc_api;
pub mod heap;
mod loom_testing;
pub mod page_store;
pub mod pages;
#[cfg(test)]
mod test_gc;
pub mod util;

pub use allocator::{AllocatorRoot, GlobalGuard, SizeClass, ThreadShard, MAX_THREADS};
pub use gc_api::GcApi;
pub use heap::Heap;
