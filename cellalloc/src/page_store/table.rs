//! Stable arena of page slots
//!
//! Stacks never link pages directly. Instead every page sits in a slot of its
//! pool's page table, and stacks link slots by index. Slots are never freed
//! while the table lives (only the page inside them is), so a thread that
//! raced with a page being freed still reads a valid (if stale) link.
//!
//! The table is a fixed directory of lazily allocated chunks, so growing it
//! never moves existing slots.

use std::{fmt::Debug, ptr, sync::atomic::Ordering};

use tracing::Level;

use crate::{loom_testing::*, pages::Page, util::UsizePtr};

/// log2 of the number of slots per chunk
#[cfg(not(loom))]
const CHUNK_SHIFT: usize = 10;
#[cfg(loom)]
const CHUNK_SHIFT: usize = 2;
/// Number of slots per chunk
const CHUNK_SZ: usize = 1 << CHUNK_SHIFT;
/// Number of chunks in the directory
#[cfg(not(loom))]
const MAX_CHUNKS: usize = 512;
#[cfg(loom)]
const MAX_CHUNKS: usize = 4;
/// Maximum number of pages a single pool can hold at once
///
/// This is a hard limit, and running into it panics.
/// With 256 KiB pages it is 128 GiB per pool.
pub const MAX_SLOTS: usize = CHUNK_SZ * MAX_CHUNKS;
const _: () = assert!(MAX_SLOTS < NO_SLOT as usize);

/// Index of a slot in a [PageTable]
pub type SlotId = u32;
/// Link value meaning "no slot"
pub const NO_SLOT: SlotId = u32::MAX;

/// One entry of a [PageTable]
pub struct PageSlot<P> {
    /// Next slot in whichever stack this slot is in
    ///
    /// Only meaningful while the slot sits in a stack.
    /// Atomic only because a popping thread may read a link that is being
    /// rewritten at the same time (the pop then fails its CAS).
    pub(super) next: AtomicU32,
    /// The page, or null if this slot is vacant
    pub(super) page: AtomicPtr<P>,
}

impl<P> PageSlot<P> {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NO_SLOT),
            page: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<P> Debug for PageSlot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSlot")
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("page", &UsizePtr::from(self.page.load(Ordering::Relaxed)))
            .finish()
    }
}

pub struct PageTable<P: Page> {
    /// Chunks of [CHUNK_SZ] slots each, null until first needed
    chunks: Box<[AtomicPtr<PageSlot<P>>]>,
    /// Number of slots ever handed out
    high_water: AtomicU32,
}

impl<P: Page> Debug for PageTable<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTable")
            .field("@addr", &(self as *const _))
            .field("kind", &P::KIND)
            .field("high_water", &self.high_water.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: Page> PageTable<P> {
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            high_water: AtomicU32::new(0),
        }
    }

    /// Look up a slot that has previously been returned by [Self::fresh_slot]
    pub fn slot(&self, id: SlotId) -> &PageSlot<P> {
        let id = id as usize;
        // order: the chunk was published with release ordering
        // before its first slot could be handed to anyone
        let chunk = self.chunks[id >> CHUNK_SHIFT].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null());
        // safety: chunks are never freed while the table lives,
        // and the index is in bounds of the chunk
        unsafe { &*chunk.add(id & (CHUNK_SZ - 1)) }
    }

    /// Get a never-before-used slot, growing the table if necessary
    pub fn fresh_slot(&self) -> SlotId {
        let id = self.high_water.fetch_add(1, Ordering::Relaxed) as usize;
        if id >= MAX_SLOTS {
            tracing::error!(kind = P::KIND, max = MAX_SLOTS, "page table full");
            panic!("Page table full, more than {} {} pages", MAX_SLOTS, P::KIND);
        }

        let chunk_ent = &self.chunks[id >> CHUNK_SHIFT];
        if chunk_ent.load(Ordering::Acquire).is_null() {
            let new_chunk = Box::into_raw(
                (0..CHUNK_SZ)
                    .map(|_| PageSlot::<P>::new())
                    .collect::<Box<[_]>>(),
            ) as *mut PageSlot<P>;
            // order: slot initialization must be visible to whoever loads the chunk
            match chunk_ent.compare_exchange(
                ptr::null_mut(),
                new_chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::event!(
                        Level::DEBUG,
                        kind = P::KIND,
                        chunk = id >> CHUNK_SHIFT,
                        ptr = ?UsizePtr::from(new_chunk),
                        "page table grew"
                    );
                }
                Err(_) => {
                    // somebody else installed this chunk first
                    // safety: we just created this and nobody else has seen it
                    unsafe {
                        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                            new_chunk, CHUNK_SZ,
                        )));
                    }
                }
            }
        }

        id as SlotId
    }

    /// Number of slots ever handed out
    pub fn high_water(&self) -> usize {
        // fresh_slot bumps the counter before checking it
        (self.high_water.load(Ordering::Relaxed) as usize).min(MAX_SLOTS)
    }
}

impl<P: Page> Drop for PageTable<P> {
    fn drop(&mut self) {
        let high_water = self.high_water();
        for i in 0..high_water {
            let page = self.slot(i as SlotId).page.load(Ordering::Relaxed);
            if let Some(page) = ptr::NonNull::new(page) {
                // safety: we are the last user of the table, so nobody holds this page
                unsafe { P::destroy(page) };
            }
        }

        for chunk_ent in self.chunks.iter() {
            let chunk = chunk_ent.load(Ordering::Relaxed);
            if !chunk.is_null() {
                // safety: allocated in fresh_slot as a boxed slice of CHUNK_SZ
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(chunk, CHUNK_SZ)));
                }
            }
        }
    }
}
