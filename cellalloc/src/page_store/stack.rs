//! Lock-free LIFO of page table slots

use std::{fmt::Debug, sync::atomic::Ordering};

use tracing::Level;

use crate::{loom_testing::*, pages::Page};

use super::table::{PageTable, SlotId, NO_SLOT};

/// Head word layout: low 32 bits are the top slot, high 32 bits are a tag
/// that is bumped on every change so that a stale head never compares equal
const fn pack(slot: SlotId, tag: u32) -> u64 {
    ((tag as u64) << 32) | slot as u64
}

const fn unpack(head: u64) -> (SlotId, u32) {
    (head as u32, (head >> 32) as u32)
}

/// Treiber stack linking slots of one [PageTable]
///
/// The stack itself does not know which table it links into,
/// so every operation takes the table as an argument.
/// Mixing tables on one stack is a logic error.
pub struct PageStack {
    head: AtomicU64,
}

impl Debug for PageStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (top, tag) = unpack(self.head.load(Ordering::Relaxed));
        f.debug_struct("PageStack")
            .field("@addr", &(self as *const _))
            .field("top", &top)
            .field("tag", &tag)
            .finish()
    }
}

impl PageStack {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(NO_SLOT, 0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).0 == NO_SLOT
    }

    /// Remove the top slot, if any
    pub fn pop<P: Page>(&self, table: &PageTable<P>) -> Option<SlotId> {
        // order: acquire pairs with the release in push,
        // so that we see the link written before the slot was published
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            let (top, tag) = unpack(old);
            if top == NO_SLOT {
                return None;
            }
            // this may be stale if another thread popped `top` in the meantime,
            // in which case the tag has changed and the CAS below fails
            let next = table.slot(top).next.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                old,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::event!(Level::TRACE, stack = ?(self as *const _), slot = top, "pop");
                    return Some(top);
                }
                Err(x) => {
                    old = x;
                    spin_hint();
                }
            }
        }
    }

    /// Put `slot` on top of the stack
    ///
    /// The caller must own `slot`, i.e. it must not currently be in any stack.
    pub fn push<P: Page>(&self, table: &PageTable<P>, slot: SlotId) {
        debug_assert_ne!(slot, NO_SLOT);
        let slot_ent = table.slot(slot);
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            let (top, tag) = unpack(old);
            slot_ent.next.store(top, Ordering::Relaxed);
            // order: release publishes the link (and the page contents) to the popper
            match self.head.compare_exchange_weak(
                old,
                pack(slot, tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    tracing::event!(Level::TRACE, stack = ?(self as *const _), slot, "push");
                    return;
                }
                Err(x) => {
                    old = x;
                    spin_hint();
                }
            }
        }
    }

    /// Move every slot of `other` into this stack, leaving `other` empty
    ///
    /// The moved slots go underneath the ones already here, keeping their order.
    /// Only this stack is walked, so moving into an empty stack is O(1).
    ///
    /// Safety: nobody else may be using either stack at the same time
    pub unsafe fn transfer_all_from<P: Page>(&self, other: &PageStack, table: &PageTable<P>) {
        let (other_top, other_tag) = unpack(other.head.load(Ordering::Acquire));
        if other_top == NO_SLOT {
            return;
        }
        other
            .head
            .store(pack(NO_SLOT, other_tag.wrapping_add(1)), Ordering::Release);

        let (self_top, self_tag) = unpack(self.head.load(Ordering::Acquire));
        let mut walked = 0;
        if self_top == NO_SLOT {
            self.head
                .store(pack(other_top, self_tag.wrapping_add(1)), Ordering::Release);
        } else {
            let mut tail = self_top;
            loop {
                walked += 1;
                let next = table.slot(tail).next.load(Ordering::Relaxed);
                if next == NO_SLOT {
                    break;
                }
                tail = next;
            }
            table.slot(tail).next.store(other_top, Ordering::Relaxed);
            // the top didn't change, but bump the tag anyway
            self.head
                .store(pack(self_top, self_tag.wrapping_add(1)), Ordering::Release);
        }
        tracing::event!(
            Level::TRACE,
            from = ?(other as *const _),
            to = ?(self as *const _),
            walked,
            "transfer_all_from"
        );
    }

    /// Slots in the stack, top first
    ///
    /// Safety: nobody else may be using the stack at the same time
    pub unsafe fn _debug_slots<P: Page>(&self, table: &PageTable<P>) -> Vec<SlotId> {
        let mut ret = Vec::new();
        let mut slot = unpack(self.head.load(Ordering::Acquire)).0;
        while slot != NO_SLOT {
            ret.push(slot);
            slot = table.slot(slot).next.load(Ordering::Relaxed);
        }
        ret
    }
}
