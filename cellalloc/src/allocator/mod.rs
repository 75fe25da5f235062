//! Top-level object allocator
//!
//! Every mutator thread allocates through its own [ThreadShard], which caches
//! one small page per block size plus one medium page. Cache misses go to the
//! shared [Heap], which never blocks. Large objects always get a fresh page.
//!
//! The collector side works in two steps. First, with mutators stopped,
//! [AllocatorRoot::prepare_for_gc] (or [GlobalGuard::prepare_for_gc]) drops
//! every cached page and marks every page as unswept. Then, after marking,
//! [AllocatorRoot::sweep] reclaims dead objects. Mutators may already be
//! allocating again while the sweep runs; they sweep pages themselves as
//! they pick them up.

use std::{
    cell::UnsafeCell,
    fmt::Debug,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    gc_api::GcApi,
    heap::{Heap, HeapStateCounts},
    loom_testing::*,
    pages::{MediumPage, SmallPage, LARGE_PAGE_SIZE_THRESHOLD, SMALL_PAGE_MAX_BLOCK_SIZE},
    util::UsizePtr,
    CELL_SIZE,
};

/// Absolute maximum number of threads that can be allocating at once
///
/// Limited to 64 so that a u64 atomic bitfield can track which
/// per-thread caches are in use.
pub const MAX_THREADS: usize = 64;
const _: () = assert!(MAX_THREADS <= 64);

/// Which kind of page an allocation comes from, and how many cells it takes there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Block size in cells
    Small(usize),
    /// Block size in cells, including the block header
    Medium(usize),
    /// Payload size in cells
    Large(usize),
}

impl SizeClass {
    pub fn for_bytes(size: usize) -> Self {
        // zero-sized objects still need a unique address
        let cells = size.div_ceil(CELL_SIZE).max(1);
        if cells <= SMALL_PAGE_MAX_BLOCK_SIZE {
            Self::Small(cells)
        } else if cells > LARGE_PAGE_SIZE_THRESHOLD {
            Self::Large(cells)
        } else {
            Self::Medium(cells + 1)
        }
    }
}

/// Pages that one thread is currently allocating from
struct ThreadCache {
    /// Indexed by block size in cells, minus one
    small: [Option<NonNull<SmallPage>>; SMALL_PAGE_MAX_BLOCK_SIZE],
    medium: Option<NonNull<MediumPage>>,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            small: [None; SMALL_PAGE_MAX_BLOCK_SIZE],
            medium: None,
        }
    }

    fn clear(&mut self) {
        self.small = [None; SMALL_PAGE_MAX_BLOCK_SIZE];
        self.medium = None;
    }
}

impl Debug for ThreadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let small: Vec<_> = self
            .small
            .iter()
            .enumerate()
            .filter_map(|(i, page)| page.map(|page| (i + 1, UsizePtr::from(page))))
            .collect();
        f.debug_struct("ThreadCache")
            .field("@addr", &(self as *const _))
            .field("small", &small)
            .field("medium", &self.medium.map(UsizePtr::from))
            .finish()
    }
}

/// Allocator root object
pub struct AllocatorRoot<G: GcApi> {
    heap: Heap<G>,
    /// Bitfield, where a `1` bit in position `n` indicates that
    /// a [ThreadShard] has been handed out for the nth entry of
    /// [per_thread_state](Self::per_thread_state)
    /// (and it hasn't been dropped yet)
    thread_inuse: AtomicU64,
    /// Page caches, one per possible [ThreadShard]
    per_thread_state: Box<[UnsafeCell<ThreadCache>]>,
}
// safety: caches hold pages that belong to the heap, not to any one thread
unsafe impl<G: GcApi> Send for AllocatorRoot<G> {}
// safety: each cache is only touched by the one shard that owns its bit in
// thread_inuse, or with every shard gone or parked
unsafe impl<G: GcApi> Sync for AllocatorRoot<G> {}

impl<G: GcApi> Debug for AllocatorRoot<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // caches may be in use, so only GlobalGuard prints them
        f.debug_struct("AllocatorRoot")
            .field("@addr", &(self as *const _))
            .field("thread_inuse", &self.thread_inuse.load(Ordering::Relaxed))
            .field("heap", &self.heap)
            .finish()
    }
}

impl<G: GcApi> AllocatorRoot<G> {
    pub fn new(gc: G) -> Self {
        Self {
            heap: Heap::new(gc),
            thread_inuse: AtomicU64::new(0),
            per_thread_state: (0..MAX_THREADS)
                .map(|_| UnsafeCell::new(ThreadCache::new()))
                .collect(),
        }
    }

    pub fn heap(&self) -> &Heap<G> {
        &self.heap
    }

    /// Get a handle for allocating from one thread
    ///
    /// Panics if [MAX_THREADS] is reached, or if a global lock exists
    pub fn new_thread(&self) -> ThreadShard<'_, G> {
        let allocated_tid;
        // order: need to synchronize-with only the thread that released
        // this thread id, so that we see its last updates to the cache
        let mut old_inuse = self.thread_inuse.load(Ordering::Relaxed);
        loop {
            let next_tid = old_inuse.trailing_ones();
            if next_tid as usize >= MAX_THREADS {
                panic!("No more threads allowed, or global lock acquired!");
            }
            let new_inuse = old_inuse | (1 << next_tid);
            match self.thread_inuse.compare_exchange_weak(
                old_inuse,
                new_inuse,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    allocated_tid = next_tid as usize;
                    break;
                }
                Err(x) => {
                    old_inuse = x;
                }
            }
        }

        tracing::event!(Level::DEBUG, tid = allocated_tid, "new_thread");
        ThreadShard {
            root: self,
            tid: allocated_tid,
            _p: PhantomData,
        }
    }

    /// Try and get a handle for performing global operations
    ///
    /// Fails if any [ThreadShard] is still alive.
    pub fn try_lock_global(&self) -> Option<GlobalGuard<'_, G>> {
        // order: need to synchronize-with every thread that dropped a shard,
        // after which we will read/write fresh updated caches
        match self
            .thread_inuse
            .compare_exchange(0, u64::MAX, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(GlobalGuard(self, PhantomData)),
            Err(_) => None,
        }
    }

    /// Drop every thread's cached pages and mark every page as unswept
    ///
    /// Safety: every thread that holds a [ThreadShard] must be stopped outside
    /// of [ThreadShard::allocate] for the duration of this call.
    /// Use [GlobalGuard::prepare_for_gc] if the shards can be dropped instead.
    pub unsafe fn prepare_for_gc(&self) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::prepare_for_gc");
        let _span_enter = trace_span.enter();

        for cache in self.per_thread_state.iter() {
            (*cache.get()).clear();
        }
        self.heap.prepare_for_gc();
    }

    /// Reclaim every object that was not marked since the last [Self::prepare_for_gc]
    ///
    /// May run while other threads are allocating.
    pub fn sweep(&self) {
        self.heap.sweep();
    }
}

/// Handle for performing global operations on the heap
///
/// The only way to get one of these is to go through [AllocatorRoot::try_lock_global]
pub struct GlobalGuard<'a, G: GcApi>(
    &'a AllocatorRoot<G>,
    /// prevent this type from being `Sync`
    PhantomData<UnsafeCell<()>>,
);

impl<'a, G: GcApi> Debug for GlobalGuard<'a, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // no shards exist, so all of the caches are safe to look at
        let mut fields = f.debug_struct(&format!("GlobalGuard(@{:?})", self.0 as *const _));
        for i in 0..MAX_THREADS {
            fields.field(&format!("per_thread_state[{}]", i), unsafe {
                &*self.0.per_thread_state[i].get()
            });
        }
        fields.finish()
    }
}

impl<'a, G: GcApi> Drop for GlobalGuard<'a, G> {
    fn drop(&mut self) {
        // ordering: need all manipulation of thread-owned data to stick
        self.0.thread_inuse.store(0, Ordering::Release);
    }
}

impl<'a, G: GcApi> GlobalGuard<'a, G> {
    pub fn prepare_for_gc(&self) {
        // safety: holding the guard means no shards exist
        unsafe { self.0.prepare_for_gc() }
    }

    pub fn sweep(&self) {
        self.0.sweep();
    }

    /// Check every pool for lost or duplicated pages, returning page counts
    pub fn _debug_check(&self) -> HeapStateCounts {
        // safety: holding the guard means nobody else can be allocating
        unsafe { self.0.heap._debug_check() }
    }
}

/// Per-thread handle for allocating objects
///
/// This type is `Send` but not `Sync`, so only one thread at a time
/// can use the cache that it stands for.
pub struct ThreadShard<'a, G: GcApi> {
    root: &'a AllocatorRoot<G>,
    /// Bit position in the [AllocatorRoot::thread_inuse] bitfield
    pub(crate) tid: usize,
    /// prevent this type from being `Sync`
    _p: PhantomData<UnsafeCell<()>>,
}

impl<'a, G: GcApi> Debug for ThreadShard<'a, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadShard")
            .field("tid", &self.tid)
            .field("cache", self.cache())
            .finish()
    }
}

impl<'a, G: GcApi> Drop for ThreadShard<'a, G> {
    fn drop(&mut self) {
        // cached pages stay cached for the next shard with this tid
        let mask = !(1 << self.tid);
        // ordering: need all manipulation of thread-owned data to stick
        self.root.thread_inuse.fetch_and(mask, Ordering::Release);
    }
}

impl<'a, G: GcApi> ThreadShard<'a, G> {
    fn cache(&self) -> &ThreadCache {
        // safety: we own this tid
        unsafe { &*self.root.per_thread_state[self.tid].get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn cache_mut(&self) -> &mut ThreadCache {
        // safety: we own this tid, and we are not Sync, and nothing
        // below allocate() calls back into this shard
        unsafe { &mut *self.root.per_thread_state[self.tid].get() }
    }

    fn allocate_small(&self, cells: usize) -> NonNull<u8> {
        let cache = self.cache_mut();
        if let Some(mut page) = cache.small[cells - 1] {
            // safety: cached pages are owned by this thread until the next GC
            if let Some(block) = unsafe { page.as_mut() }.try_allocate() {
                return block;
            }
        }
        loop {
            let mut page = self.root.heap.get_small_page(cells);
            // safety: pages from the heap are ours until the next GC
            if let Some(block) = unsafe { page.as_mut() }.try_allocate() {
                cache.small[cells - 1] = Some(page);
                return block;
            }
        }
    }

    fn allocate_medium(&self, cells: usize) -> NonNull<u8> {
        let cache = self.cache_mut();
        let cells = cells as u32;
        if let Some(mut page) = cache.medium {
            // safety: cached pages are owned by this thread until the next GC
            if let Some(block) = unsafe { page.as_mut() }.try_allocate(cells) {
                return block;
            }
        }
        loop {
            let mut page = self.root.heap.get_medium_page(cells as usize);
            // safety: pages from the heap are ours until the next GC
            if let Some(block) = unsafe { page.as_mut() }.try_allocate(cells) {
                cache.medium = Some(page);
                return block;
            }
        }
    }

    /// Allocate `size` bytes of zeroed memory, aligned to a cell
    ///
    /// Never fails; running out of memory aborts the process.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::allocate", tid = self.tid, size);
        let _span_enter = trace_span.enter();

        let class = SizeClass::for_bytes(size);
        let block = match class {
            SizeClass::Small(cells) => self.allocate_small(cells),
            SizeClass::Medium(cells) => self.allocate_medium(cells),
            SizeClass::Large(cells) => {
                let page = self.root.heap.get_large_page(cells);
                // safety: the page was just created for us
                unsafe { page.as_ref() }.data()
            }
        };

        // safety: the block is at least `size` bytes
        unsafe { ptr::write_bytes(block.as_ptr(), 0, size) };
        tracing::event!(Level::TRACE, ?class, ptr = ?UsizePtr::from(block));
        block
    }

    /// Explicitly free an object
    ///
    /// Does nothing: objects are only ever reclaimed by sweeping.
    pub fn free(&self, obj: NonNull<u8>) {
        tracing::warn!(tid = self.tid, ptr = ?UsizePtr::from(obj), "explicit free is not supported, ignoring");
    }
}
