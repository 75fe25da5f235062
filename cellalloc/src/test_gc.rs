//! Stand-in collector for tests
//!
//! Objects are "marked" by putting their payload address into a set;
//! [GcApi::try_reset_mark] removes them again, just like a real mark bit.

use std::{ptr::NonNull, sync::Mutex};

use rustc_hash::FxHashSet;

use crate::gc_api::GcApi;

#[derive(Debug, Default)]
pub struct MarkSetGc {
    marked: Mutex<FxHashSet<usize>>,
    finalizable: Mutex<FxHashSet<usize>>,
}

impl MarkSetGc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, obj: NonNull<u8>) {
        self.marked.lock().unwrap().insert(obj.as_ptr() as usize);
    }

    pub fn mark_all<I: IntoIterator<Item = NonNull<u8>>>(&self, objs: I) {
        let mut marked = self.marked.lock().unwrap();
        for obj in objs {
            marked.insert(obj.as_ptr() as usize);
        }
    }

    pub fn set_finalizable(&self, obj: NonNull<u8>) {
        self.finalizable.lock().unwrap().insert(obj.as_ptr() as usize);
    }

    /// Marks that have not been consumed by a sweep yet
    pub fn num_marked(&self) -> usize {
        self.marked.lock().unwrap().len()
    }
}

impl GcApi for MarkSetGc {
    fn try_reset_mark(&self, obj: NonNull<u8>) -> bool {
        self.marked.lock().unwrap().remove(&(obj.as_ptr() as usize))
    }

    fn has_finalizer(&self, obj: NonNull<u8>) -> bool {
        self.finalizable
            .lock()
            .unwrap()
            .contains(&(obj.as_ptr() as usize))
    }
}
