//! Boundary between the allocator and the rest of the runtime
//!
//! The allocator never marks anything itself. During sweep, every page asks the
//! collector (through [GcApi]) whether the object at a given payload address
//! survived the last mark phase. Raw page memory comes from the global Rust
//! allocator; running out of it is fatal.

use std::{
    alloc::{self, Layout},
    process,
    ptr::NonNull,
};

use crate::{util::UsizePtr, CELL_SIZE};

/// Alignment of every page handed out by [raw_alloc]
pub const PAGE_ALIGN: usize = CELL_SIZE;

/// Hooks that the collector provides to the allocator
///
/// Implementations must be callable from any thread, as sweeping happens
/// on whichever mutator pops an unswept page.
pub trait GcApi: Send + Sync {
    /// Returns whether the object whose payload starts at `obj` was marked
    /// reachable during the last mark phase, clearing the mark as a side effect
    fn try_reset_mark(&self, obj: NonNull<u8>) -> bool;

    /// Returns whether the (dead) object at `obj` has a finalizer
    ///
    /// Only used for diagnostics.
    fn has_finalizer(&self, _obj: NonNull<u8>) -> bool {
        false
    }
}

impl<G: GcApi + ?Sized> GcApi for &G {
    fn try_reset_mark(&self, obj: NonNull<u8>) -> bool {
        (**self).try_reset_mark(obj)
    }

    fn has_finalizer(&self, obj: NonNull<u8>) -> bool {
        (**self).has_finalizer(obj)
    }
}

/// Liveness query used by every page type during sweep
///
/// Dead objects with finalizers are reclaimed anyway, with a warning.
pub fn is_live<G: GcApi>(gc: &G, obj: NonNull<u8>) -> bool {
    if gc.try_reset_mark(obj) {
        return true;
    }
    if gc.has_finalizer(obj) {
        tracing::warn!(obj = ?UsizePtr::from(obj), "finalizer ignored for reclaimed object");
    }
    false
}

fn page_layout(size: usize) -> Layout {
    match Layout::from_size_align(size, PAGE_ALIGN) {
        Ok(layout) => layout,
        Err(_) => {
            tracing::error!(size, "page size overflows the address space, aborting");
            process::abort();
        }
    }
}

/// Get `size` bytes of raw memory for a new page
///
/// Never returns on failure: the runtime cannot proceed without heap memory.
pub fn raw_alloc(size: usize) -> NonNull<u8> {
    debug_assert!(size > 0);
    let layout = page_layout(size);
    // safety: layout has nonzero size
    let mem = unsafe { alloc::alloc(layout) };
    match NonNull::new(mem) {
        Some(mem) => {
            tracing::trace!(size, ptr = ?UsizePtr::from(mem), "raw_alloc");
            mem
        }
        None => {
            tracing::error!(size, "out of memory trying to allocate a page, aborting");
            alloc::handle_alloc_error(layout)
        }
    }
}

/// Give a page back to the environment
///
/// `mem` must have come from [raw_alloc] with the same `size`.
pub unsafe fn raw_free(mem: NonNull<u8>, size: usize) {
    tracing::trace!(size, ptr = ?UsizePtr::from(mem), "raw_free");
    alloc::dealloc(mem.as_ptr(), page_layout(size));
}
