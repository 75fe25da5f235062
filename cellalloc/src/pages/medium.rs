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

/// Bytes at the start of a medium page taken up by its header
pub(crate) const MEDIUM_PAGE_HDR_SZ: usize = roundto(size_of::<MediumPage>(), CELL_SIZE);
/// Number of cells available for blocks (headers included) in a medium page
pub const MEDIUM_PAGE_CELL_COUNT: usize = (PAGE_SIZE - MEDIUM_PAGE_HDR_SZ) / CELL_SIZE;

/// Header cell in front of every medium block
///
/// The size counts the header cell itself, so it is also the distance
/// to the next block. There is no footer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHeader {
    Free { size: u32 },
    Allocated { size: u32 },
}
const _: () = assert!(size_of::<BlockHeader>() == CELL_SIZE);

impl BlockHeader {
    pub const fn free(size: u32) -> Self {
        Self::Free { size }
    }

    pub const fn allocated(size: u32) -> Self {
        Self::Allocated { size }
    }

    pub const fn size(self) -> u32 {
        match self {
            Self::Free { size } | Self::Allocated { size } => size,
        }
    }

    pub const fn is_allocated(self) -> bool {
        matches!(self, Self::Allocated { .. })
    }
}

/// Page of variable-size blocks
///
/// Allocation splits the tail off of the "current" free block.
/// Free neighbours are only merged during sweep.
#[repr(C)]
pub struct MediumPage {
    cells: NonNull<BlockHeader>,
    cell_count: u32,
    /// Free block that allocation is attempted from first
    cur_block: Option<u32>,
}

// safety: a page is only ever touched by the thread that currently owns it
unsafe impl Send for MediumPage {}

impl Debug for MediumPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediumPage")
            .field("@addr", &(self as *const _))
            .field("cell_count", &self.cell_count)
            .field("cur_block", &self.cur_block)
            .finish()
    }
}

impl MediumPage {
    /// Set up a medium page at the start of `mem`, as one big free block
    ///
    /// `mem` must be valid for `byte_len` bytes, aligned to a cell,
    /// and must outlive the page.
    pub unsafe fn init(mem: NonNull<u8>, byte_len: usize) -> NonNull<Self> {
        assert!(byte_len > MEDIUM_PAGE_HDR_SZ);
        debug_assert_eq!(mem.as_ptr() as usize % CELL_SIZE, 0);

        let cell_count = (byte_len - MEDIUM_PAGE_HDR_SZ) / CELL_SIZE;
        assert!(cell_count <= u32::MAX as usize);
        let cells =
            NonNull::new_unchecked(mem.as_ptr().add(MEDIUM_PAGE_HDR_SZ)).cast::<BlockHeader>();
        cells
            .as_ptr()
            .write(BlockHeader::free(cell_count as u32));

        let page = mem.cast::<Self>();
        ptr::write(
            page.as_ptr(),
            Self {
                cells,
                cell_count: cell_count as u32,
                cur_block: Some(0),
            },
        );
        page
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count as usize
    }

    pub fn cur_block(&self) -> Option<usize> {
        self.cur_block.map(|x| x as usize)
    }

    fn header(&self, block: usize) -> BlockHeader {
        debug_assert!(block < self.cell_count());
        // safety: in bounds, and only ever called on block starts
        unsafe { *self.cells.as_ptr().add(block) }
    }

    fn set_header(&mut self, block: usize, hdr: BlockHeader) {
        debug_assert!(block + hdr.size() as usize <= self.cell_count());
        // safety: in bounds
        unsafe { *self.cells.as_ptr().add(block) = hdr }
    }

    fn payload(&self, block: usize) -> NonNull<u8> {
        // safety: the payload starts right after the header cell
        unsafe { NonNull::new_unchecked(self.cells.as_ptr().add(block + 1).cast()) }
    }

    /// Cell index of the block whose payload starts at `obj`
    pub fn block_index(&self, obj: NonNull<u8>) -> usize {
        let offs = obj.as_ptr() as usize - self.cells.as_ptr() as usize;
        debug_assert_eq!(offs % CELL_SIZE, 0);
        offs / CELL_SIZE - 1
    }

    fn deallocate(&mut self, block: usize) {
        let hdr = self.header(block);
        assert!(hdr.is_allocated(), "block is not currently allocated");
        self.set_header(block, BlockHeader::free(hdr.size()));
    }

    /// Split `cells_needed` cells off the end of the current block
    fn split_cur_block(&mut self, cells_needed: u32) -> Option<NonNull<u8>> {
        let cur = self.cur_block? as usize;
        let BlockHeader::Free { size } = self.header(cur) else {
            return None;
        };
        if cells_needed > size {
            return None;
        }

        let remaining = size - cells_needed;
        let new_block = cur + remaining as usize;
        if remaining != 0 {
            self.set_header(cur, BlockHeader::free(remaining));
        }
        self.set_header(new_block, BlockHeader::allocated(cells_needed));
        debug_assert!(remaining == 0 || self.header(cur).size() + cells_needed == size);

        let ret = self.payload(new_block);
        tracing::event!(
            Level::TRACE,
            page = ?UsizePtr::from(&*self),
            cells_needed,
            block = new_block,
            ptr = ?UsizePtr::from(ret),
            "medium page allocate"
        );
        Some(ret)
    }

    /// Allocate a block of `cells_needed` cells (header included)
    ///
    /// Returns `None` if no free block on the page is big enough.
    pub fn try_allocate(&mut self, cells_needed: u32) -> Option<NonNull<u8>> {
        debug_assert!(cells_needed > 0, "can only allocate a positive number of cells");
        if let Some(block) = self.split_cur_block(cells_needed) {
            return Some(block);
        }
        self.update_cur_block(cells_needed);
        self.split_cur_block(cells_needed)
    }

    /// Scan blocks in `[from, to)` for a free block of at least `cells_needed`
    /// cells, remembering the largest free block seen in `largest`
    fn scan_free_blocks(
        &self,
        from: usize,
        to: usize,
        cells_needed: u32,
        largest: &mut Option<(usize, u32)>,
    ) -> Option<usize> {
        let mut block = from;
        while block < to {
            let hdr = self.header(block);
            if let BlockHeader::Free { size } = hdr {
                if largest.map_or(true, |(_, largest_sz)| size > largest_sz) {
                    *largest = Some((block, size));
                }
                if size >= cells_needed {
                    return Some(block);
                }
            }
            block += hdr.size() as usize;
        }
        None
    }

    /// Point the current block at a free block with room for `cells_needed` cells
    ///
    /// Searches from the current block to the end of the page first, then
    /// from the start of the page. If no block is big enough, the largest
    /// free block becomes current (or none, if nothing is free).
    pub fn update_cur_block(&mut self, cells_needed: u32) {
        let trace_span = tracing::span!(
            Level::TRACE,
            "MediumPage::update_cur_block",
            page = ?UsizePtr::from(&*self),
            cells_needed
        );
        let _span_enter = trace_span.enter();

        let start = self.cur_block().unwrap_or(0);
        let mut largest = None;
        if let Some(found) = self.scan_free_blocks(start, self.cell_count(), cells_needed, &mut largest) {
            self.cur_block = Some(found as u32);
            return;
        }
        tracing::event!(Level::TRACE, "starting from beginning");
        if let Some(found) = self.scan_free_blocks(0, start, cells_needed, &mut largest) {
            self.cur_block = Some(found as u32);
            return;
        }
        self.cur_block = largest.map(|(block, _)| block as u32);
    }

    /// All blocks on the page, as (cell index, header)
    pub fn _debug_blocks(&self) -> Vec<(usize, BlockHeader)> {
        let mut ret = Vec::new();
        let mut block = 0;
        while block < self.cell_count() {
            let hdr = self.header(block);
            ret.push((block, hdr));
            block += hdr.size() as usize;
        }
        ret
    }
}

impl Page for MediumPage {
    const KIND: &'static str = "medium";

    fn create(_size_hint: usize) -> NonNull<Self> {
        let mem = raw_alloc(PAGE_SIZE);
        // safety: fresh allocation of PAGE_SIZE bytes
        let page = unsafe { Self::init(mem, PAGE_SIZE) };
        tracing::event!(Level::INFO, page = ?UsizePtr::from(page), "MediumPage::create");
        page
    }

    unsafe fn destroy(page: NonNull<Self>) {
        tracing::event!(Level::INFO, page = ?UsizePtr::from(page), "MediumPage::destroy");
        raw_free(page.cast(), PAGE_SIZE);
    }

    fn sweep<G: GcApi>(&mut self, gc: &G) -> bool {
        let trace_span = tracing::span!(Level::TRACE, "MediumPage::sweep", page = ?UsizePtr::from(&*self));
        let _span_enter = trace_span.enter();

        let end = self.cell_count();
        let mut alive = false;
        let mut block = 0;
        while block < end {
            let hdr = self.header(block);
            if hdr.is_allocated() {
                if is_live(gc, self.payload(block)) {
                    alive = true;
                } else {
                    self.deallocate(block);
                }
            }
            block += hdr.size() as usize;
        }

        // merge runs of free blocks, keeping the largest result as current
        let mut largest: Option<(usize, u32)> = None;
        let mut block = 0;
        while block < end {
            let BlockHeader::Free { mut size } = self.header(block) else {
                block += self.header(block).size() as usize;
                continue;
            };
            let mut next = block + size as usize;
            while next < end {
                match self.header(next) {
                    BlockHeader::Free { size: next_size } => {
                        size += next_size;
                        next += next_size as usize;
                    }
                    BlockHeader::Allocated { .. } => break,
                }
            }
            self.set_header(block, BlockHeader::free(size));
            if largest.map_or(true, |(_, largest_sz)| size > largest_sz) {
                largest = Some((block, size));
            }
            block = next;
        }
        self.cur_block = largest.map(|(block, _)| block as u32);

        tracing::event!(Level::TRACE, alive, cur_block = ?self.cur_block);
        alive
    }
}
