use hazel::*;

use crossbeam_utils::thread;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::Mutex;

#[derive(Default, Debug)]
struct Count {
    ctors: AtomicUsize,
    dtors: AtomicUsize,
}

impl Count {
    fn test_local() -> &'static Count {
        Box::leak(Box::new(Self::default()))
    }

    fn ctors(&self) -> usize {
        self.ctors.load(Ordering::SeqCst)
    }

    fn dtors(&self) -> usize {
        self.dtors.load(Ordering::SeqCst)
    }
}

struct Node {
    header: RetiredHeader,
    count: &'static Count,
    val: usize,
}

unsafe impl Retirable for Node {
    fn retired_header(&self) -> &RetiredHeader {
        &self.header
    }
}

impl Node {
    fn boxed(count: &'static Count, val: usize) -> *mut Node {
        count.ctors.fetch_add(1, Ordering::AcqRel);
        Box::into_raw(Box::new(Self {
            header: RetiredHeader::new(),
            count,
            val,
        }))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.count.dtors.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn basic_objects() {
    let count = Count::test_local();
    let domain = Domain::new();
    let mut num = 0;
    {
        num += 1;
        let x = Node::boxed(count, 0);
        unsafe { domain.retire(x, deleters::drop_box) };
    }
    assert_eq!(num, count.ctors());
    domain.eager_reclaim();
    assert_eq!(num, count.dtors());
}

#[test]
fn basic_owners() {
    {
        let _h = Owner::new();
    }
    {
        let domain = Domain::new();
        let _h1 = Owner::new_in(&domain);
        let _h2 = Owner::try_new_in(&domain).unwrap();
        assert_eq!(domain.slot_count(), 2);
    }
}

#[test]
fn basic_protection() {
    let count = Count::test_local();
    let domain = Domain::new();
    let obj = Node::boxed(count, 0);
    let mut h = Owner::new_in(&domain);
    h.set(obj);
    unsafe { domain.retire(obj, deleters::drop_box) };
    assert_eq!(1, count.ctors());
    domain.eager_reclaim();
    assert_eq!(0, count.dtors());
    h.reset();
    domain.eager_reclaim();
    assert_eq!(1, count.dtors());
}

#[test]
fn protect_loads_the_current_value() {
    let count = Count::test_local();
    let domain = Domain::new();
    let shared = AtomicPtr::new(Node::boxed(count, 42));

    let mut h = Owner::new_in(&domain);
    let node = unsafe { h.protect(&shared) }.expect("not null");

    let old = shared.swap(Node::boxed(count, 9001), Ordering::SeqCst);
    unsafe { domain.retire(old, deleters::drop_box) };
    assert_eq!(domain.eager_reclaim(), 0);
    assert_eq!(node.val, 42);

    drop(h);
    assert_eq!(domain.eager_reclaim(), 1);
    assert_eq!(1, count.dtors());

    let last = shared.swap(std::ptr::null_mut(), Ordering::SeqCst);
    unsafe { domain.retire(last, deleters::drop_box) };
    drop(domain);
    assert_eq!(2, count.dtors());
}

#[test]
fn destruction() {
    let domain = Domain::new();
    let dtors = Box::leak(Box::new(AtomicUsize::new(0)));

    struct HeadRetireNext<'domain> {
        header: RetiredHeader,
        next: *mut HeadRetireNext<'domain>,
        domain: &'domain Domain,
        dtors: &'static AtomicUsize,
    }

    unsafe impl Retirable for HeadRetireNext<'_> {
        fn retired_header(&self) -> &RetiredHeader {
            &self.header
        }
    }

    impl Drop for HeadRetireNext<'_> {
        fn drop(&mut self) {
            self.dtors.fetch_add(1, Ordering::AcqRel);
            if !self.next.is_null() {
                unsafe { self.domain.retire(self.next, deleters::drop_box) };
            }
        }
    }

    // Holding a slot keeps the threshold above zero, so each retire from a reclaim does not
    // immediately recurse into another scan.
    let _h = Owner::new_in(&domain);

    let mut last = std::ptr::null_mut();
    for _ in 0..2000 {
        last = Box::into_raw(Box::new(HeadRetireNext {
            header: RetiredHeader::new(),
            next: last,
            domain: &domain,
            dtors,
        }));
    }
    unsafe { domain.retire(last, deleters::drop_box) };

    let mut reclaimed = 0;
    loop {
        let n = domain.eager_reclaim();
        if n == 0 {
            break;
        }
        reclaimed += n;
    }
    assert_eq!(2000, reclaimed);
    assert_eq!(2000, dtors.load(Ordering::SeqCst));
}

#[test]
fn move_test() {
    let count = Count::test_local();
    let domain = Domain::new();
    let a = Node::boxed(count, 1);
    let b = Node::boxed(count, 2);

    let mut h0 = Owner::new_in(&domain);
    let mut h1 = Owner::new_in(&domain);
    h0.set(a);
    h1.set(b);
    std::mem::swap(&mut h0, &mut h1);

    unsafe { domain.retire(a, deleters::drop_box) };
    unsafe { domain.retire(b, deleters::drop_box) };
    assert_eq!(domain.eager_reclaim(), 0);

    // h1 now holds the slot protecting a.
    drop(h1);
    assert_eq!(domain.eager_reclaim(), 1);
    assert_eq!(1, count.dtors());

    let h2 = h0;
    assert_eq!(domain.eager_reclaim(), 0);
    drop(h2);
    assert_eq!(domain.eager_reclaim(), 1);
    assert_eq!(2, count.dtors());
}

#[test]
fn teardown_reclaims_everything_once() {
    let count = Count::test_local();
    {
        let domain = Domain::new();
        let slot = domain.acquire().unwrap();
        let protected = Node::boxed(count, 0);
        domain.set(slot, protected as *mut u8);
        unsafe { domain.retire(protected, deleters::drop_box) };
        unsafe { domain.retire(Node::boxed(count, 1), deleters::drop_box) };
        assert_eq!(domain.eager_reclaim(), 1);
        assert_eq!(domain.retired_count(), 1);
        // The slot is never released, and still protects the first node.
    }
    assert_eq!(2, count.ctors());
    assert_eq!(2, count.dtors());
}

#[test]
fn threshold() {
    let count = Count::test_local();
    let domain = Domain::new();
    let _h = Owner::new_in(&domain);
    assert_eq!(THRESHOLD_FACTOR * domain.slot_count(), 3);

    assert_eq!(unsafe { domain.retire(Node::boxed(count, 0), deleters::drop_box) }, 0);
    assert_eq!(unsafe { domain.retire(Node::boxed(count, 1), deleters::drop_box) }, 1);
    assert_eq!(0, count.dtors());
    assert_eq!(unsafe { domain.retire(Node::boxed(count, 2), deleters::drop_box) }, 2);
    assert_eq!(3, count.dtors());
    assert_eq!(domain.retired_count(), 0);
}

#[test]
fn concurrent_acquire_hands_out_distinct_slots() {
    const THREADS: usize = 8;
    const ITERS: usize = 2_000;

    let domain = Domain::new();
    let held = Mutex::new(HashSet::new());
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|_| {
                for _ in 0..ITERS {
                    let slot = domain.acquire().unwrap();
                    let addr = slot as *const Slot as usize;
                    assert!(held.lock().unwrap().insert(addr), "slot handed out twice");
                    assert!(held.lock().unwrap().remove(&addr));
                    domain.release(slot);
                }
            });
        }
    })
    .unwrap();
    assert!(domain.slot_count() <= THREADS);
}

#[test]
fn concurrent_retire_with_readers() {
    const READERS: usize = 4;
    const UPDATES: usize = 5_000;

    let count = Count::test_local();
    let domain = Domain::new();
    let shared = AtomicPtr::new(Node::boxed(count, 0));
    let done = std::sync::atomic::AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..READERS {
            s.spawn(|_| {
                let mut h = Owner::new_in(&domain);
                while !done.load(Ordering::Acquire) {
                    let node = unsafe { h.protect(&shared) }.expect("never null");
                    assert!(node.val <= UPDATES);
                }
            });
        }
        for i in 1..=UPDATES {
            let old = shared.swap(Node::boxed(count, i), Ordering::AcqRel);
            unsafe { domain.retire(old, deleters::drop_box) };
        }
        done.store(true, Ordering::Release);
    })
    .unwrap();

    let last = shared.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { domain.retire(last, deleters::drop_box) };
    domain.eager_reclaim();
    assert_eq!(count.ctors(), count.dtors());
}
