//! Page types
//!
//! Every page is a single chunk of raw memory obtained from [raw_alloc],
//! starting with a small header followed by the cells that blocks are carved
//! out of. The header stores a pointer to its own cells so that the cells are
//! always reached with the provenance of the whole allocation, never through
//! a reference to the header.
//!
//! * [SmallPage]: fixed-size blocks of 1..=[SMALL_PAGE_MAX_BLOCK_SIZE] cells,
//!   with an intrusive free list whose links always point forward
//! * [MediumPage]: variable-size blocks with a one-cell header each,
//!   coalesced in place during sweep
//! * [LargePage]: exactly one allocation
//!
//! [raw_alloc]: crate::gc_api::raw_alloc

use std::ptr::NonNull;

use crate::gc_api::GcApi;

mod large;
mod medium;
mod small;

pub use large::*;
pub use medium::*;
pub use small::*;

/// Size in bytes of small and medium pages
pub const PAGE_SIZE: usize = 256 * 1024;

/// Operations every page type supports, used by the page store
pub trait Page: Sized {
    /// Name used in tracing output
    const KIND: &'static str;

    /// Obtain memory for a new page and initialize it
    ///
    /// `size_hint` is the block size for small pages, the allocation size
    /// for large pages, and ignored for medium pages (all in cells).
    fn create(size_hint: usize) -> NonNull<Self>;

    /// Return the page's memory to the environment
    ///
    /// `page` must have come from [Page::create] and must not be used again.
    unsafe fn destroy(page: NonNull<Self>);

    /// Reclaim every block whose object is no longer marked
    ///
    /// Returns whether anything on the page survived.
    fn sweep<G: GcApi>(&mut self, gc: &G) -> bool;
}
