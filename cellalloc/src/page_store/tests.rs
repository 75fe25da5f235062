use std::ptr::NonNull;

use rustc_hash::FxHashSet;

use super::*;
use crate::{pages::SmallPage, test_gc::MarkSetGc};

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn store_is_send_sync() {
    assert_send::<PageStore<SmallPage>>();
    assert_sync::<PageStore<SmallPage>>();
}

/// Put one object on `page` and return it
fn alloc_one(mut page: NonNull<SmallPage>) -> NonNull<u8> {
    unsafe { page.as_mut() }.try_allocate().unwrap()
}

#[cfg(not(loom))]
#[test]
fn stack_push_pop_lifo() {
    let table = PageTable::<SmallPage>::new();
    let stack = PageStack::new();
    let slots = [table.fresh_slot(), table.fresh_slot(), table.fresh_slot()];
    assert_eq!(slots, [0, 1, 2]);
    assert!(stack.is_empty());

    for slot in slots {
        stack.push(&table, slot);
    }
    assert!(!stack.is_empty());
    assert_eq!(unsafe { stack._debug_slots(&table) }, vec![2, 1, 0]);

    assert_eq!(stack.pop(&table), Some(2));
    assert_eq!(stack.pop(&table), Some(1));
    assert_eq!(stack.pop(&table), Some(0));
    assert_eq!(stack.pop(&table), None);
    assert!(stack.is_empty());
}

#[cfg(not(loom))]
#[test]
fn stack_transfer_all_from() {
    let table = PageTable::<SmallPage>::new();
    let dest = PageStack::new();
    let src = PageStack::new();
    let slots: Vec<_> = (0..5).map(|_| table.fresh_slot()).collect();
    dest.push(&table, slots[0]);
    dest.push(&table, slots[1]);
    src.push(&table, slots[2]);
    src.push(&table, slots[3]);
    src.push(&table, slots[4]);

    unsafe {
        dest.transfer_all_from(&src, &table);
        assert!(src.is_empty());
        assert_eq!(dest._debug_slots(&table), vec![1, 0, 4, 3, 2]);

        // moving from an empty stack changes nothing
        dest.transfer_all_from(&src, &table);
        assert_eq!(dest._debug_slots(&table), vec![1, 0, 4, 3, 2]);

        // and moving into an empty stack just takes over the whole chain
        src.transfer_all_from(&dest, &table);
        assert!(dest.is_empty());
        assert_eq!(src._debug_slots(&table), vec![1, 0, 4, 3, 2]);
    }

    // the source chain is left alone, only the destination's tail is relinked
    let big = PageStack::new();
    let small = PageStack::new();
    let more: Vec<_> = (0..4).map(|_| table.fresh_slot()).collect();
    unsafe { big.transfer_all_from(&src, &table) };
    small.push(&table, more[0]);
    for &slot in &more[1..] {
        big.push(&table, slot);
    }
    unsafe {
        small.transfer_all_from(&big, &table);
        assert_eq!(table.slot(more[0]).next.load(Ordering::Relaxed), more[3]);
        assert_eq!(small._debug_slots(&table), vec![5, 8, 7, 6, 1, 0, 4, 3, 2]);
    }
}

#[cfg(not(loom))]
#[test]
fn table_grows_across_chunks() {
    let table = PageTable::<SmallPage>::new();
    for i in 0..3000 {
        let slot = table.fresh_slot();
        assert_eq!(slot, i);
        table.slot(slot).next.store(i ^ 0x55, Ordering::Relaxed);
    }
    assert_eq!(table.high_water(), 3000);
    for i in 0..3000 {
        assert_eq!(table.slot(i).next.load(Ordering::Relaxed), i ^ 0x55);
    }
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn table_full() {
    let table = PageTable::<SmallPage>::new();
    for _ in 0..MAX_SLOTS {
        table.fresh_slot();
    }
    assert_eq!(table.high_water(), MAX_SLOTS);
    table.fresh_slot();
}

#[cfg(not(loom))]
#[test]
fn stack_concurrent_push_pop() {
    const NTHREADS: u32 = 4;
    const PER_THREAD: u32 = 1000;

    let table = PageTable::<SmallPage>::new();
    let stack = PageStack::new();
    for _ in 0..NTHREADS * PER_THREAD {
        table.fresh_slot();
    }

    let popped = std::thread::scope(|s| {
        let threads: Vec<_> = (0..NTHREADS)
            .map(|t| {
                let table = &table;
                let stack = &stack;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(table, t * PER_THREAD + i);
                    }
                    // every thread pushed before popping, so this never runs dry
                    (0..PER_THREAD)
                        .map(|_| stack.pop(table).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert!(stack.is_empty());
    let unique: FxHashSet<_> = popped.iter().copied().collect();
    assert_eq!(popped.len(), (NTHREADS * PER_THREAD) as usize);
    assert_eq!(unique.len(), popped.len());
}

#[cfg(not(loom))]
#[test]
fn store_new_page_is_used() {
    let store = PageStore::<SmallPage>::new();
    let page = store.new_page(4);
    assert_eq!(unsafe { page.as_ref() }.block_size(), 4);
    assert_eq!(store.page_count(), 1);
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 0,
            ready: 0,
            used: 1
        }
    );
}

#[cfg(not(loom))]
#[test]
fn store_get_page_creates_when_empty() {
    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    let p1 = store.get_page(2, &gc);
    let p2 = store.get_page(2, &gc);
    assert_ne!(p1, p2);
    assert_eq!(store.page_count(), 2);
    assert_eq!(unsafe { store._debug_check() }.used, 2);
}

#[cfg(not(loom))]
#[test]
fn store_get_page_sweeps_unswept_first() {
    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    let keep = store.new_page(1);
    let lose = store.new_page(1);
    gc.mark(alloc_one(keep));
    alloc_one(lose);

    unsafe { store.prepare_for_gc() };
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 2,
            ready: 0,
            used: 0
        }
    );

    // `lose` is on top and has nothing live, so it gets freed on the way to `keep`
    let got = store.get_page(1, &gc);
    assert_eq!(got, keep);
    assert_eq!(store.page_count(), 1);
    assert_eq!(gc.num_marked(), 0);
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 0,
            ready: 0,
            used: 1
        }
    );

    // the kept object is still allocated
    assert_eq!(unsafe { got.as_ref() }._debug_free_list()[0], 1);
}

#[cfg(not(loom))]
#[test]
fn store_get_page_reuses_ready() {
    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    let page = store.new_page(3);
    gc.mark(alloc_one(page));

    unsafe { store.prepare_for_gc() };
    store.sweep(&gc);
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 0,
            ready: 1,
            used: 0
        }
    );

    assert_eq!(store.get_page(3, &gc), page);
    assert_eq!(store.page_count(), 1);
    assert_eq!(unsafe { store._debug_check() }.used, 1);
}

#[cfg(not(loom))]
#[test]
fn store_sweep_frees_dead_pages() {
    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    for _ in 0..3 {
        let page = store.new_page(1);
        alloc_one(page);
    }
    // never allocated from at all
    store.new_page(1);
    assert_eq!(store.page_count(), 4);

    unsafe { store.prepare_for_gc() };
    store.sweep(&gc);
    assert_eq!(store.page_count(), 0);
    assert_eq!(unsafe { store._debug_check() }, PageStateCounts::default());

    // freed slots get recycled instead of growing the table
    store.get_page(1, &gc);
    store.get_page(1, &gc);
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.table.high_water(), 4);
    assert_eq!(unsafe { store._debug_check() }.used, 2);
}

#[cfg(not(loom))]
#[test]
fn store_prepare_for_gc_collects_ready_and_used() {
    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    let a = store.new_page(1);
    let b = store.new_page(1);
    gc.mark(alloc_one(a));
    gc.mark(alloc_one(b));
    unsafe { store.prepare_for_gc() };
    store.sweep(&gc);

    // one ready, plus one used
    store.get_page(1, &gc);
    store.new_page(1);
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 0,
            ready: 1,
            used: 2
        }
    );

    unsafe { store.prepare_for_gc() };
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 3,
            ready: 0,
            used: 0
        }
    );
}

#[cfg(not(loom))]
#[test]
fn store_concurrent_get_page_hands_out_each_page_once() {
    const NPAGES: usize = 16;
    const NTHREADS: usize = 4;

    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    let mut pages = FxHashSet::default();
    for _ in 0..NPAGES {
        let page = store.new_page(2);
        gc.mark(alloc_one(page));
        pages.insert(page.as_ptr() as usize);
    }
    unsafe { store.prepare_for_gc() };

    let got = std::thread::scope(|s| {
        let threads: Vec<_> = (0..NTHREADS)
            .map(|_| {
                let store = &store;
                let gc = &gc;
                s.spawn(move || {
                    (0..NPAGES / NTHREADS)
                        .map(|_| store.get_page(2, gc).as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect::<Vec<_>>()
    });

    let got_set: FxHashSet<_> = got.iter().copied().collect();
    assert_eq!(got_set.len(), NPAGES);
    assert_eq!(got_set, pages);
    assert_eq!(store.page_count(), NPAGES);
    assert_eq!(unsafe { store._debug_check() }.used, NPAGES);
}

#[cfg(not(loom))]
#[test]
fn store_concurrent_sweep() {
    const NPAGES: usize = 32;

    let gc = MarkSetGc::new();
    let store = PageStore::<SmallPage>::new();
    for i in 0..NPAGES {
        let page = store.new_page(1);
        let obj = alloc_one(page);
        if i % 2 == 0 {
            gc.mark(obj);
        }
    }
    unsafe { store.prepare_for_gc() };

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| store.sweep(&gc));
        }
    });

    assert_eq!(store.page_count(), NPAGES / 2);
    assert_eq!(
        unsafe { store._debug_check() },
        PageStateCounts {
            unswept: 0,
            ready: NPAGES / 2,
            used: 0
        }
    );
}

#[cfg(loom)]
#[test]
fn store_loom_stack_push_pop() {
    loom::model(|| {
        let table = &*Box::leak(Box::new(PageTable::<SmallPage>::new()));
        let stack = &*Box::leak(Box::new(PageStack::new()));
        let s0 = table.fresh_slot();
        let s1 = table.fresh_slot();
        let s2 = table.fresh_slot();
        stack.push(table, s2);

        let t0 = loom::thread::spawn(move || {
            stack.push(table, s0);
            stack.pop(table).unwrap()
        });
        let t1 = loom::thread::spawn(move || {
            stack.push(table, s1);
            stack.pop(table).unwrap()
        });

        let a = t0.join().unwrap();
        let b = t1.join().unwrap();
        let c = stack.pop(table).unwrap();
        assert_eq!(stack.pop(table), None);

        let mut all = [a, b, c];
        all.sort();
        assert_eq!(all, [s0, s1, s2]);
    })
}

#[cfg(loom)]
#[test]
fn store_loom_fresh_slot_race() {
    loom::model(|| {
        let table = &*Box::leak(Box::new(PageTable::<SmallPage>::new()));

        let t0 = loom::thread::spawn(move || table.fresh_slot());
        let t1 = loom::thread::spawn(move || table.fresh_slot());
        let a = t0.join().unwrap();
        let b = t1.join().unwrap();
        assert_ne!(a, b);
        table.slot(a).next.store(b, Ordering::Relaxed);
        table.slot(b).next.store(a, Ordering::Relaxed);
        assert_eq!(table.slot(a).next.load(Ordering::Relaxed), b);
        assert_eq!(table.slot(b).next.load(Ordering::Relaxed), a);
    })
}

#[cfg(loom)]
#[test]
fn store_loom_get_page() {
    use loom::sync::Arc;

    loom::model(|| {
        let gc = Arc::new(MarkSetGc::new());
        let store = Arc::new(PageStore::<SmallPage>::new());
        let live = store.new_page(1);
        gc.mark(alloc_one(live));
        let dead = store.new_page(1);
        alloc_one(dead);
        unsafe { store.prepare_for_gc() };

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let gc = gc.clone();
                let store = store.clone();
                loom::thread::spawn(move || store.get_page(1, &*gc).as_ptr() as usize)
            })
            .collect();
        let got: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        // one thread gets the live page, the other finds nothing and makes a new one
        assert_ne!(got[0], got[1]);
        assert!(got.contains(&(live.as_ptr() as usize)));
        assert_eq!(store.page_count(), 2);
        assert_eq!(unsafe { store._debug_check() }.used, 2);
    })
}
