//! Per-pool page bookkeeping
//!
//! Every pool of pages (one per small block size, one for medium pages, one
//! for large pages) is a [PageStore]. Each page in a store is in exactly one
//! of these states:
//!
//! * **unswept**: waiting to be swept after the last mark phase
//! * **ready**: swept and known to have free space
//! * **used**: handed out to a mutator thread (or swept concurrently,
//!   or holding only a single large object)
//!
//! A page that turns out to hold nothing live when swept is given back to the
//! environment instead of becoming ready.
//!
//! All transitions are lock-free, except for [PageStore::prepare_for_gc],
//! which must only run while mutators are stopped.

use std::{fmt::Debug, ptr::NonNull, sync::atomic::Ordering};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{gc_api::GcApi, loom_testing::*, pages::Page, util::UsizePtr};

mod stack;
mod table;

pub use stack::PageStack;
pub use table::{PageTable, SlotId, MAX_SLOTS};

/// Number of pages in each state, as found by [PageStore::_debug_check]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStateCounts {
    pub unswept: usize,
    pub ready: usize,
    pub used: usize,
}

impl PageStateCounts {
    pub fn total(&self) -> usize {
        self.unswept + self.ready + self.used
    }
}

impl std::ops::AddAssign for PageStateCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.unswept += rhs.unswept;
        self.ready += rhs.ready;
        self.used += rhs.used;
    }
}

pub struct PageStore<P: Page> {
    table: PageTable<P>,
    unswept: PageStack,
    ready: PageStack,
    used: PageStack,
    /// Slots whose page has been given back, available for new pages
    vacant: PageStack,
    /// Number of pages currently owned by this store
    num_pages: AtomicUsize,
}

impl<P: Page> Debug for PageStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("@addr", &(self as *const _))
            .field("kind", &P::KIND)
            .field("num_pages", &self.num_pages.load(Ordering::Relaxed))
            .field("unswept", &self.unswept)
            .field("ready", &self.ready)
            .field("used", &self.used)
            .finish()
    }
}

impl<P: Page> PageStore<P> {
    pub fn new() -> Self {
        Self {
            table: PageTable::new(),
            unswept: PageStack::new(),
            ready: PageStack::new(),
            used: PageStack::new(),
            vacant: PageStack::new(),
            num_pages: AtomicUsize::new(0),
        }
    }

    fn page_of(&self, slot: SlotId) -> NonNull<P> {
        let page = self.table.slot(slot).page.load(Ordering::Relaxed);
        debug_assert!(!page.is_null(), "slot {} has no page", slot);
        // safety: slots in the unswept/ready/used stacks always hold a page
        unsafe { NonNull::new_unchecked(page) }
    }

    /// Find a home in the page table for a freshly created page
    fn install(&self, page: NonNull<P>) -> SlotId {
        let slot = match self.vacant.pop(&self.table) {
            Some(slot) => slot,
            None => self.table.fresh_slot(),
        };
        self.table
            .slot(slot)
            .page
            .store(page.as_ptr(), Ordering::Relaxed);
        self.num_pages.fetch_add(1, Ordering::Relaxed);
        slot
    }

    /// Give the page in `slot` back to the environment and recycle the slot
    fn free(&self, slot: SlotId) {
        let page = self
            .table
            .slot(slot)
            .page
            .swap(std::ptr::null_mut(), Ordering::Relaxed);
        debug_assert!(!page.is_null());
        if let Some(page) = NonNull::new(page) {
            // safety: the caller popped `slot`, so nobody else can reach the page
            unsafe { P::destroy(page) };
        }
        self.vacant.push(&self.table, slot);
        self.num_pages.fetch_sub(1, Ordering::Relaxed);
    }

    /// Create a brand new page, which starts out in the used state
    ///
    /// The caller owns the returned page until the next [Self::prepare_for_gc].
    pub fn new_page(&self, size_hint: usize) -> NonNull<P> {
        let page = P::create(size_hint);
        let slot = self.install(page);
        self.used.push(&self.table, slot);
        tracing::event!(
            Level::DEBUG,
            kind = P::KIND,
            slot,
            page = ?UsizePtr::from(page),
            "new page"
        );
        page
    }

    /// Sweep pages from `from` until one with free space turns up
    ///
    /// Pages with nothing live are freed along the way.
    /// The page that is returned has already been pushed onto `to`.
    fn sweep_one<G: GcApi>(&self, from: &PageStack, to: &PageStack, gc: &G) -> Option<NonNull<P>> {
        while let Some(slot) = from.pop(&self.table) {
            let mut page = self.page_of(slot);
            // safety: popping the slot gave us exclusive access to the page
            let alive = unsafe { page.as_mut() }.sweep(gc);
            if alive {
                tracing::event!(Level::DEBUG, kind = P::KIND, slot, page = ?UsizePtr::from(page), "swept, still in use");
                to.push(&self.table, slot);
                return Some(page);
            }
            tracing::event!(Level::DEBUG, kind = P::KIND, slot, page = ?UsizePtr::from(page), "swept, empty");
            self.free(slot);
        }
        None
    }

    /// Sweep every unswept page, moving survivors to ready
    ///
    /// Safe to call concurrently with [Self::get_page] and with itself.
    pub fn sweep<G: GcApi>(&self, gc: &G) {
        let trace_span = tracing::span!(Level::TRACE, "PageStore::sweep", kind = P::KIND);
        let _span_enter = trace_span.enter();

        while self.sweep_one(&self.unswept, &self.ready, gc).is_some() {}
    }

    /// Get a page to allocate from
    ///
    /// Prefers sweeping an unswept page, then a ready page, and
    /// creates a new page only if neither exists.
    /// The caller owns the returned page until the next [Self::prepare_for_gc].
    pub fn get_page<G: GcApi>(&self, size_hint: usize, gc: &G) -> NonNull<P> {
        let trace_span = tracing::span!(Level::TRACE, "PageStore::get_page", kind = P::KIND, size_hint);
        let _span_enter = trace_span.enter();

        if let Some(page) = self.sweep_one(&self.unswept, &self.used, gc) {
            return page;
        }
        if let Some(slot) = self.ready.pop(&self.table) {
            let page = self.page_of(slot);
            tracing::event!(Level::DEBUG, kind = P::KIND, slot, page = ?UsizePtr::from(page), "reusing ready page");
            self.used.push(&self.table, slot);
            return page;
        }
        self.new_page(size_hint)
    }

    /// Mark every page as unswept, ahead of a new mark phase
    ///
    /// Safety: no other thread may touch this store at the same time,
    /// and nobody may keep using pages handed out by [Self::get_page]
    /// or [Self::new_page] afterwards
    pub unsafe fn prepare_for_gc(&self) {
        tracing::event!(Level::DEBUG, kind = P::KIND, pages = self.page_count(), "prepare_for_gc");
        self.unswept.transfer_all_from(&self.ready, &self.table);
        self.unswept.transfer_all_from(&self.used, &self.table);
    }

    /// Number of pages currently held by this store
    pub fn page_count(&self) -> usize {
        self.num_pages.load(Ordering::Relaxed)
    }

    /// Walk every stack, checking that no page is in two states at once
    /// and that no page has gone missing
    ///
    /// Safety: no other thread may touch this store at the same time
    pub unsafe fn _debug_check(&self) -> PageStateCounts {
        let mut seen = FxHashSet::default();
        let mut walk = |stack: &PageStack, state: &str| -> usize {
            let slots = stack._debug_slots(&self.table);
            for &slot in &slots {
                let page = self.page_of(slot);
                if !seen.insert(page.as_ptr() as usize) {
                    panic!("{} page {:?} found more than once ({})", P::KIND, page, state);
                }
            }
            slots.len()
        };
        let counts = PageStateCounts {
            unswept: walk(&self.unswept, "unswept"),
            ready: walk(&self.ready, "ready"),
            used: walk(&self.used, "used"),
        };

        for slot in self.vacant._debug_slots(&self.table) {
            assert!(
                self.table.slot(slot).page.load(Ordering::Relaxed).is_null(),
                "vacant slot {} still holds a page",
                slot
            );
        }
        assert_eq!(counts.total(), self.page_count(), "{} pages went missing", P::KIND);
        counts
    }
}

#[cfg(test)]
mod tests;
