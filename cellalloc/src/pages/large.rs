use std::{
    fmt::Debug,
    mem::size_of,
    process,
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    gc_api::{is_live, raw_alloc, raw_free, GcApi},
    util::{roundto, UsizePtr},
    CELL_SIZE,
};

use super::{Page, MEDIUM_PAGE_CELL_COUNT};

/// Allocations of more than this many cells get a page of their own
pub const LARGE_PAGE_SIZE_THRESHOLD: usize = MEDIUM_PAGE_CELL_COUNT - 1;
/// Bytes at the start of a large page taken up by its header
const LARGE_PAGE_HDR_SZ: usize = roundto(size_of::<LargePage>(), CELL_SIZE);

/// Page holding exactly one allocation
#[repr(C)]
pub struct LargePage {
    data: NonNull<u8>,
    cell_count: usize,
}

// safety: a page is only ever touched by the thread that currently owns it
unsafe impl Send for LargePage {}

impl Debug for LargePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargePage")
            .field("@addr", &(self as *const _))
            .field("data", &UsizePtr::from(self.data))
            .field("cell_count", &self.cell_count)
            .finish()
    }
}

impl LargePage {
    /// Total size of a large page holding `cell_count` cells
    fn byte_len(cell_count: usize) -> usize {
        match cell_count
            .checked_mul(CELL_SIZE)
            .and_then(|x| x.checked_add(LARGE_PAGE_HDR_SZ))
        {
            Some(x) => x,
            None => {
                tracing::error!(cell_count, "large allocation overflows the address space, aborting");
                process::abort();
            }
        }
    }

    /// Set up a large page at the start of `mem`
    ///
    /// `mem` must be valid for `byte_len(cell_count)` bytes and aligned to a cell.
    unsafe fn init(mem: NonNull<u8>, cell_count: usize) -> NonNull<Self> {
        let data = NonNull::new_unchecked(mem.as_ptr().add(LARGE_PAGE_HDR_SZ));
        let page = mem.cast::<Self>();
        ptr::write(page.as_ptr(), Self { data, cell_count });
        page
    }

    /// The one allocation on this page
    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }
}

impl Page for LargePage {
    const KIND: &'static str = "large";

    fn create(size_hint: usize) -> NonNull<Self> {
        debug_assert!(size_hint > 0);
        let mem = raw_alloc(Self::byte_len(size_hint));
        // safety: allocation is exactly big enough
        let page = unsafe { Self::init(mem, size_hint) };
        tracing::event!(Level::INFO, cell_count = size_hint, page = ?UsizePtr::from(page), "LargePage::create");
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        let cell_count = page.as_ref().cell_count;
        tracing::event!(Level::INFO, cell_count, page = ?UsizePtr::from(page), "LargePage::destroy");
        raw_free(page.cast(), Self::byte_len(cell_count));
    }

    fn sweep<G: GcApi>(&mut self, gc: &G) -> bool {
        let alive = is_live(gc, self.data);
        tracing::event!(Level::TRACE, page = ?UsizePtr::from(&*self), alive, "LargePage::sweep");
        alive
    }
}
