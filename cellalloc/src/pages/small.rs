use std::{
    fmt::Debug,
    mem::size_of,
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    gc_api::{is_live, raw_alloc, raw_free, GcApi},
    util::{roundto, UsizePtr},
    CELL_SIZE,
};

use super::{Page, PAGE_SIZE};

/// Largest block size (in cells) served from small pages
pub const SMALL_PAGE_MAX_BLOCK_SIZE: usize = 128;
/// Bytes at the start of a small page taken up by its header
pub(crate) const SMALL_PAGE_HDR_SZ: usize = roundto(size_of::<SmallPage>(), CELL_SIZE);
/// Number of cells available for blocks in a small page
pub const SMALL_PAGE_CELL_COUNT: usize = (PAGE_SIZE - SMALL_PAGE_HDR_SZ) / CELL_SIZE;

/// Where a free-list link lives: the page header, or the first cell of a free block
#[derive(Debug, Clone, Copy)]
enum FreeLink {
    Head,
    Block(usize),
}

/// Page of equally sized blocks
///
/// A free block stores the cell index of the next free block in its first cell.
/// Links always point forward, so every block between two consecutive links
/// is allocated. The list ends at the first index where a block no longer fits.
#[repr(C)]
pub struct SmallPage {
    cells: NonNull<u64>,
    block_size: u32,
    cell_count: u32,
    free_head: u32,
}

// safety: a page is only ever touched by the thread that currently owns it
unsafe impl Send for SmallPage {}

impl Debug for SmallPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmallPage")
            .field("@addr", &(self as *const _))
            .field("block_size", &self.block_size)
            .field("cell_count", &self.cell_count)
            .field("free_head", &self.free_head)
            .finish()
    }
}

impl SmallPage {
    /// Set up a small page at the start of `mem`
    ///
    /// `mem` must be valid for `byte_len` bytes, aligned to a cell,
    /// and must outlive the page.
    pub unsafe fn init(mem: NonNull<u8>, byte_len: usize, block_size: u32) -> NonNull<Self> {
        assert!(block_size >= 1 && block_size as usize <= SMALL_PAGE_MAX_BLOCK_SIZE);
        assert!(byte_len >= SMALL_PAGE_HDR_SZ + block_size as usize * CELL_SIZE);
        debug_assert_eq!(mem.as_ptr() as usize % CELL_SIZE, 0);

        let cell_count = (byte_len - SMALL_PAGE_HDR_SZ) / CELL_SIZE;
        let cells = NonNull::new_unchecked(mem.as_ptr().add(SMALL_PAGE_HDR_SZ)).cast::<u64>();
        let page = mem.cast::<Self>();
        ptr::write(
            page.as_ptr(),
            Self {
                cells,
                block_size,
                cell_count: cell_count as u32,
                free_head: 0,
            },
        );

        let block_size = block_size as usize;
        let mut block = 0;
        while block + block_size <= cell_count {
            cells.as_ptr().add(block).write((block + block_size) as u64);
            block += block_size;
        }

        page
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count as usize
    }

    fn block_ptr(&self, block: usize) -> NonNull<u8> {
        debug_assert!(block + self.block_size() <= self.cell_count());
        // safety: in bounds of the page
        unsafe { NonNull::new_unchecked(self.cells.as_ptr().add(block).cast()) }
    }

    /// Cell index of the block whose payload starts at `obj`
    pub fn block_index(&self, obj: NonNull<u8>) -> usize {
        let offs = obj.as_ptr() as usize - self.cells.as_ptr() as usize;
        debug_assert_eq!(offs % (self.block_size() * CELL_SIZE), 0);
        offs / CELL_SIZE
    }

    fn load_next(&self, block: usize) -> usize {
        // safety: in bounds, and only free blocks are ever read as links
        unsafe { *self.cells.as_ptr().add(block) as usize }
    }

    fn store_next(&mut self, block: usize, next: usize) {
        // safety: in bounds
        unsafe { *self.cells.as_ptr().add(block) = next as u64 }
    }

    fn load_link(&self, link: FreeLink) -> usize {
        match link {
            FreeLink::Head => self.free_head as usize,
            FreeLink::Block(block) => self.load_next(block),
        }
    }

    fn store_link(&mut self, link: FreeLink, next: usize) {
        match link {
            FreeLink::Head => self.free_head = next as u32,
            FreeLink::Block(block) => self.store_next(block, next),
        }
    }

    /// Pop the first free block, or `None` if the page is full
    pub fn try_allocate(&mut self) -> Option<NonNull<u8>> {
        let head = self.free_head as usize;
        if head + self.block_size() > self.cell_count() {
            tracing::event!(Level::TRACE, page = ?UsizePtr::from(&*self), "small page full");
            return None;
        }
        let block = self.block_ptr(head);
        self.free_head = self.load_next(head) as u32;
        tracing::event!(
            Level::TRACE,
            page = ?UsizePtr::from(&*self),
            block_size = self.block_size,
            ptr = ?UsizePtr::from(block),
            "small page allocate"
        );
        Some(block)
    }

    /// Cell indices of the blocks on the free list, in list order
    pub fn _debug_free_list(&self) -> Vec<usize> {
        let mut ret = Vec::new();
        let mut block = self.free_head as usize;
        while block + self.block_size() <= self.cell_count() {
            ret.push(block);
            block = self.load_next(block);
        }
        ret
    }
}

impl Page for SmallPage {
    const KIND: &'static str = "small";

    fn create(size_hint: usize) -> NonNull<Self> {
        assert!(size_hint <= SMALL_PAGE_MAX_BLOCK_SIZE, "block size too large for small page");
        let mem = raw_alloc(PAGE_SIZE);
        // safety: fresh allocation of PAGE_SIZE bytes
        let page = unsafe { Self::init(mem, PAGE_SIZE, size_hint as u32) };
        tracing::event!(Level::INFO, block_size = size_hint, page = ?UsizePtr::from(page), "SmallPage::create");
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        tracing::event!(Level::INFO, page = ?UsizePtr::from(page), "SmallPage::destroy");
        raw_free(page.cast(), PAGE_SIZE);
    }

    fn sweep<G: GcApi>(&mut self, gc: &G) -> bool {
        let trace_span = tracing::span!(Level::TRACE, "SmallPage::sweep", page = ?UsizePtr::from(&*self));
        let _span_enter = trace_span.enter();

        let block_size = self.block_size();
        // one past the start of the last block that fits;
        // not necessarily the start of a block itself
        let end = self.cell_count() + 1 - block_size;
        let mut alive = false;
        let mut block = 0;
        let mut link = FreeLink::Head;
        while block < end {
            let next_free = self.load_link(link);
            // everything up to the next free block is allocated
            while block != next_free {
                debug_assert!(block < next_free);
                if is_live(gc, self.block_ptr(block)) {
                    alive = true;
                } else {
                    self.store_next(block, next_free);
                    self.store_link(link, block);
                    link = FreeLink::Block(block);
                }
                block += block_size;
            }
            if block >= end {
                break;
            }
            link = FreeLink::Block(block);
            block += block_size;
        }

        tracing::event!(Level::TRACE, alive);
        alive
    }
}
