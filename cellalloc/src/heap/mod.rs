//! All the page pools of one heap, plus the collector they answer to

use std::{fmt::Debug, ptr::NonNull};

use tracing::Level;

use crate::{
    gc_api::GcApi,
    page_store::{PageStateCounts, PageStore},
    pages::{LargePage, MediumPage, SmallPage, LARGE_PAGE_SIZE_THRESHOLD, SMALL_PAGE_MAX_BLOCK_SIZE},
};

/// Page counts per pool, as found by [Heap::_debug_check]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStateCounts {
    /// Indexed by block size in cells, minus one
    pub small: Vec<PageStateCounts>,
    pub medium: PageStateCounts,
    pub large: PageStateCounts,
}

impl HeapStateCounts {
    pub fn total(&self) -> PageStateCounts {
        let mut ret = self.medium;
        ret += self.large;
        for &small in &self.small {
            ret += small;
        }
        ret
    }
}

pub struct Heap<G: GcApi> {
    gc: G,
    /// One pool per small block size, indexed by block size in cells, minus one
    small_pages: Box<[PageStore<SmallPage>]>,
    medium_pages: PageStore<MediumPage>,
    large_pages: PageStore<LargePage>,
}

impl<G: GcApi> Debug for Heap<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("@addr", &(self as *const _))
            .field("page_count", &self.page_count())
            .finish()
    }
}

impl<G: GcApi> Heap<G> {
    pub fn new(gc: G) -> Self {
        Self {
            gc,
            small_pages: (0..SMALL_PAGE_MAX_BLOCK_SIZE)
                .map(|_| PageStore::new())
                .collect(),
            medium_pages: PageStore::new(),
            large_pages: PageStore::new(),
        }
    }

    pub fn gc(&self) -> &G {
        &self.gc
    }

    /// Get a page of blocks that are `cell_count` cells each
    pub fn get_small_page(&self, cell_count: usize) -> NonNull<SmallPage> {
        assert!(
            (1..=SMALL_PAGE_MAX_BLOCK_SIZE).contains(&cell_count),
            "{} cells is not a small block size",
            cell_count
        );
        self.small_pages[cell_count - 1].get_page(cell_count, &self.gc)
    }

    /// Get a page to allocate medium blocks from
    ///
    /// The page is not guaranteed to have room for `cell_count` cells.
    pub fn get_medium_page(&self, cell_count: usize) -> NonNull<MediumPage> {
        self.medium_pages.get_page(cell_count, &self.gc)
    }

    /// Get a fresh page holding a single object of `cell_count` cells
    pub fn get_large_page(&self, cell_count: usize) -> NonNull<LargePage> {
        debug_assert!(cell_count > LARGE_PAGE_SIZE_THRESHOLD);
        self.large_pages.new_page(cell_count)
    }

    /// Mark every page of every pool as unswept
    ///
    /// Safety: all mutators must be stopped, and none of them may keep
    /// allocating from pages they obtained before this call
    pub unsafe fn prepare_for_gc(&self) {
        let trace_span = tracing::span!(Level::TRACE, "Heap::prepare_for_gc");
        let _span_enter = trace_span.enter();

        for pool in self.small_pages.iter() {
            pool.prepare_for_gc();
        }
        self.medium_pages.prepare_for_gc();
        self.large_pages.prepare_for_gc();
    }

    /// Sweep every pool: small first, then medium, then large
    ///
    /// Safe to run while mutators allocate from this heap.
    pub fn sweep(&self) {
        let trace_span = tracing::span!(Level::TRACE, "Heap::sweep");
        let _span_enter = trace_span.enter();

        for pool in self.small_pages.iter() {
            pool.sweep(&self.gc);
        }
        self.medium_pages.sweep(&self.gc);
        self.large_pages.sweep(&self.gc);
        tracing::event!(Level::DEBUG, pages = self.page_count(), "sweep done");
    }

    /// Number of pages currently held, across all pools
    pub fn page_count(&self) -> usize {
        self.small_pages.iter().map(|x| x.page_count()).sum::<usize>()
            + self.medium_pages.page_count()
            + self.large_pages.page_count()
    }

    /// Check every pool for lost or duplicated pages
    ///
    /// Safety: no other thread may touch the heap at the same time
    pub unsafe fn _debug_check(&self) -> HeapStateCounts {
        HeapStateCounts {
            small: self.small_pages.iter().map(|x| x._debug_check()).collect(),
            medium: self.medium_pages._debug_check(),
            large: self.large_pages._debug_check(),
        }
    }
}
