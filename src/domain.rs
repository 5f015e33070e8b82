use crate::retired::{Retirable, RetiredHeader};
use crate::slot::Slot;
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
#[cfg(not(loom))]
use crate::sync::WithMut;
use crate::Error;
use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;
use crossbeam_utils::CachePadded;

/// A bulk reclamation is attempted once there are at least this many retired objects per hazard
/// slot in the domain.
pub const THRESHOLD_FACTOR: usize = 3;

/// The operations [`Owner`](crate::Owner) and the lock-free structures in this crate need from a
/// reclamation domain.
///
/// [`Domain`] is the implementation provided by this crate. The trait exists so that code can be
/// written once and monomorphised over wrappers around it (for example, a domain that
/// instruments or poisons reclaimed memory).
///
/// # Safety
///
/// 1. A slot returned by `acquire` must stay allocated for as long as `self` is borrowed, and
///    must not be handed out again until it is passed to `release`.
/// 2. An object passed to `retire` must not be reclaimed while any slot acquired from `self`
///    protects its address, as observed by a scan that starts after the object was retired.
pub unsafe trait HazardDomain: Sync {
    /// Bind a free (or newly allocated) slot.
    ///
    /// The only error an implementation may return is [`Error::OutOfMemory`]. Infallible
    /// constructors such as [`Owner::new_in`](crate::Owner::new_in) panic on any other error.
    fn acquire(&self) -> Result<&Slot, Error>;

    /// Return a slot to the free pool. The caller must not touch it afterwards.
    fn release(&self, slot: &Slot);

    /// Publish `ptr` as hazarded through `slot`.
    fn set(&self, slot: &Slot, ptr: *mut u8);

    /// Schedule `ptr` to be passed to `reclaim` once no slot protects it.
    ///
    /// Returns the number of retired objects pending before this one was added.
    ///
    /// # Safety
    ///
    /// 1. `ptr` is no longer reachable by new readers of the structure it was unlinked from.
    /// 2. `ptr` has not been retired before (unless it has since been reclaimed).
    /// 3. `ptr` stays valid until `reclaim` is called on it, and `reclaim` is a valid way to free
    ///    it from whichever thread ends up running it.
    unsafe fn retire<T: Retirable>(&self, ptr: *mut T, reclaim: unsafe fn(*mut T)) -> usize;
}

#[cfg(not(loom))]
static SHARED_DOMAIN: Domain = Domain::new();

#[cfg(loom)]
loom::lazy_static! {
    static ref SHARED_DOMAIN: Domain = Domain::new();
}

/// Synchronization point between hazard slots and the writers they guard against.
///
/// Every [`Owner`](crate::Owner) is bound to a domain, and only guards against reclamation of
/// objects that are retired into that same domain. Always retire objects into the domain whose
/// owners are used to read them; protections from another domain mean nothing.
///
/// ## Reclamation
///
/// Retired objects are pushed onto a lock-free list. Once the list holds at least
/// [`THRESHOLD_FACTOR`] objects per slot in the domain, the retiring thread tries to claim the
/// whole batch and scan it against the current set of hazards, reclaiming everything that is not
/// protected and pushing the rest back for a later scan. Claiming is a single CAS on the retired
/// count: if another thread wins it, the loser just returns and leaves the work to whichever
/// `retire` comes next.
///
/// When a domain is dropped, every object still retired into it is reclaimed, whether or not it
/// looks protected; the borrow on the domain guarantees there are no owners left at that point.
///
/// Slots are never freed while the domain lives, so the slot list only ever grows. It grows to
/// the largest number of owners that were ever alive at the same time.
pub struct Domain {
    slots: CachePadded<AtomicPtr<Slot>>,
    retired: CachePadded<AtomicPtr<RetiredHeader>>,
    slot_count: AtomicUsize,
    retired_count: AtomicUsize,
}

impl Domain {
    /// Get a handle to the process-wide domain.
    ///
    /// The global domain is never dropped, so objects that are still retired into it when the
    /// process exits are never reclaimed. Prefer constructing a [`Domain`] of your own and passing
    /// it around where you can.
    pub fn global() -> &'static Self {
        &SHARED_DOMAIN
    }
}

// Macro to make new const only when not in loom.
macro_rules! new {
    ($($decl:tt)*) => {
        /// Construct a new, empty domain.
        pub $($decl)*() -> Self {
            Self {
                slots: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
                retired: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
                slot_count: AtomicUsize::new(0),
                retired_count: AtomicUsize::new(0),
            }
        }
    };
}

impl Domain {
    #[cfg(not(loom))]
    new!(const fn new);
    #[cfg(loom)]
    new!(fn new);

    /// Number of hazard slots ever allocated by this domain.
    pub fn slot_count(&self) -> usize {
        self.slot_count.load(Ordering::Acquire)
    }

    /// Number of retired objects counted towards the next bulk reclamation.
    ///
    /// This is a heuristic: it is reset when a thread claims a batch, so it may briefly disagree
    /// with the length of the retired list.
    pub fn retired_count(&self) -> usize {
        self.retired_count.load(Ordering::Acquire)
    }

    fn acquire_slot(&self) -> Result<&Slot, Error> {
        let mut node = self.slots.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: Slots are never de-allocated while the domain lives.
            let slot = unsafe { &*node };
            if slot.try_acquire() {
                return Ok(slot);
            }
            node = slot.next.load(Ordering::Acquire);
        }
        self.acquire_new()
    }

    fn acquire_new(&self) -> Result<&Slot, Error> {
        // No free slots -- need to allocate a new one
        let layout = Layout::new::<Slot>();
        // Safety: Slot is not zero-sized.
        let slot = unsafe { alloc(layout) } as *mut Slot;
        if slot.is_null() {
            return Err(Error::OutOfMemory { layout });
        }
        // Safety: slot is freshly allocated with the layout of a Slot.
        unsafe { slot.write(Slot::new_active()) };

        // And stick it at the head of the linked list
        let mut head = self.slots.load(Ordering::Acquire);
        loop {
            // Safety: slot was never shared, so nobody else is looking at it.
            unsafe { &*slot }.next.store(head, Ordering::Relaxed);
            match self.slots.compare_exchange_weak(
                head,
                slot,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.slot_count.fetch_add(1, Ordering::SeqCst);
                    // Safety: Slots are never de-allocated while the domain lives.
                    break Ok(unsafe { &*slot });
                }
                Err(head_now) => {
                    // Head has changed, try again with that as our next ptr.
                    head = head_now
                }
            }
        }
    }

    /// Retire `ptr`, and reclaim it with `reclaim` once no slot in this domain protects it.
    ///
    /// Returns the number of objects that were pending reclamation before `ptr` was added. If
    /// adding `ptr` takes the domain over its threshold, this call may reclaim `ptr` and other
    /// objects before returning, on the calling thread.
    ///
    /// `reclaim` may itself retire more objects into this domain.
    ///
    /// # Safety
    ///
    /// 1. no [`Owner`](crate::Owner) will start protecting `ptr` from this point forward, i.e.
    ///    it has been unlinked from wherever readers could find it.
    /// 2. `ptr` has not already been retired unless it has been reclaimed since then.
    /// 3. `ptr` is valid until `reclaim` runs on it, which may be on any thread, and at the
    ///    latest when `self` is dropped.
    pub unsafe fn retire<T: Retirable>(&self, ptr: *mut T, reclaim: unsafe fn(*mut T)) -> usize {
        // Safety: ptr is valid by the caller's guarantee #3, and nobody else is retiring it (#2).
        let header = unsafe {
            let header = (*ptr).retired_header();
            header.prepare(ptr, reclaim);
            header as *const RetiredHeader as *mut RetiredHeader
        };

        crate::sync::light_barrier();

        // Safety: header is a single, valid, unlinked node.
        let previous = unsafe { self.push_retired(header, header, 1) };
        if previous + 1 >= self.threshold() {
            self.try_bulk_reclaim();
        }
        previous
    }

    /// Reclaim every retired object that is not currently protected, regardless of the
    /// threshold.
    ///
    /// Returns the number of objects that were reclaimed.
    pub fn eager_reclaim(&self) -> usize {
        self.retired_count.swap(0, Ordering::AcqRel);
        self.bulk_reclaim()
    }

    fn threshold(&self) -> usize {
        THRESHOLD_FACTOR * self.slot_count.load(Ordering::Acquire)
    }

    fn try_bulk_reclaim(&self) -> usize {
        let nslots = self.slot_count.load(Ordering::Acquire);
        let nretired = self.retired_count.load(Ordering::Acquire);
        if nretired < THRESHOLD_FACTOR * nslots {
            return 0;
        }
        // Whoever resets the count owns the scan. Losing is fine: the next retire tries again.
        if self
            .retired_count
            .compare_exchange(nretired, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }
        self.bulk_reclaim()
    }

    fn bulk_reclaim(&self) -> usize {
        // The batch must be detached before the slots are read. A hazard published after the
        // swap can only be on an object that was unlinked before it was retired, and so cannot
        // newly protect anything in the batch. Reading the slots first would miss such a hazard.
        let mut node = self.retired.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if node.is_null() {
            return 0;
        }

        crate::sync::heavy_barrier();

        let hazards = self.hazards();

        let mut survivors: *mut RetiredHeader = core::ptr::null_mut();
        let mut survivors_tail: *mut RetiredHeader = core::ptr::null_mut();
        let mut nsurvivors = 0;
        let mut nreclaimed = 0;
        while !node.is_null() {
            // Safety: we detached the whole list, so we are the only ones walking it.
            let (next, object) = {
                let header = unsafe { &*node };
                (header.next.load(Ordering::Relaxed), header.object())
            };
            debug_assert_ne!(node, next);

            if hazards.binary_search(&object).is_err() {
                // Safety: detached by us, and no slot protects the object.
                unsafe { RetiredHeader::reclaim(node) };
                nreclaimed += 1;
            } else {
                // Still guarded -- keep it for a later scan.
                unsafe { &*node }.next.store(survivors, Ordering::Relaxed);
                survivors = node;
                if survivors_tail.is_null() {
                    survivors_tail = node;
                }
                nsurvivors += 1;
            }

            node = next;
        }

        if !survivors.is_null() {
            // Safety: survivors..survivors_tail is a properly linked sublist that only we own.
            unsafe { self.push_retired(survivors, survivors_tail, nsurvivors) };
        }
        nreclaimed
    }

    /// Sorted snapshot of every non-null protected address.
    fn hazards(&self) -> Vec<*mut u8> {
        let mut hazards = Vec::with_capacity(self.slot_count.load(Ordering::Acquire));
        let mut node = self.slots.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: Slots are never de-allocated while the domain lives.
            let slot = unsafe { &*node };
            let ptr = slot.protected();
            if !ptr.is_null() {
                hazards.push(ptr);
            }
            node = slot.next.load(Ordering::Acquire);
        }
        hazards.sort_unstable();
        hazards
    }

    /// Prepend the sublist `head..=tail` onto the retired list.
    ///
    /// Returns the retired count from before `count` was added to it.
    ///
    /// # Safety
    ///
    /// `head` reaches `tail` through `next` links, and the caller owns every node in between.
    unsafe fn push_retired(
        &self,
        head: *mut RetiredHeader,
        tail: *mut RetiredHeader,
        count: usize,
    ) -> usize {
        debug_assert!(!head.is_null());
        debug_assert!(!tail.is_null());

        let mut current = self.retired.load(Ordering::Acquire);
        loop {
            // Safety: we own the sublist, so tail is still valid.
            unsafe { &*tail }.next.store(current, Ordering::Relaxed);
            match self.retired.compare_exchange_weak(
                current,
                head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(head_now) => current = head_now,
            }
        }
        self.retired_count.fetch_add(count, Ordering::AcqRel)
    }

    /// Reclaim everything on the retired list without looking at hazards.
    ///
    /// Keeps going until the list stays empty, since reclaim functions may retire more objects.
    fn reclaim_all_objects(&self) -> usize {
        let mut nreclaimed = 0;
        loop {
            let mut node = self.retired.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if node.is_null() {
                break;
            }
            while !node.is_null() {
                // Safety: detached by us.
                let next = unsafe { &*node }.next.load(Ordering::Relaxed);
                // Safety: the domain is being dropped, so no owner can be protecting anything.
                unsafe { RetiredHeader::reclaim(node) };
                nreclaimed += 1;
                node = next;
            }
        }
        self.retired_count.store(0, Ordering::Release);
        nreclaimed
    }

    fn free_slots(&mut self) {
        let mut node: *mut Slot = self.slots.with_mut(|p| *p);
        while !node.is_null() {
            // Safety: we have &mut self, so no owner holds any of our slots any more, as all
            // owners are tied to a borrow of the domain.
            let mut slot: Box<Slot> = unsafe { Box::from_raw(node) };
            node = slot.next.with_mut(|p| *p);
            drop(slot);
        }
        self.slots.with_mut(|p| *p = core::ptr::null_mut());
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.reclaim_all_objects();
        self.free_slots();
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("slot_count", &self.slot_count())
            .field("retired_count", &self.retired_count())
            .finish_non_exhaustive()
    }
}

// Safety: slots are only freed in Drop, and retire defers reclamation until a scan that starts
// after the object was pushed finds no slot protecting it.
unsafe impl HazardDomain for Domain {
    fn acquire(&self) -> Result<&Slot, Error> {
        self.acquire_slot()
    }

    fn release(&self, slot: &Slot) {
        debug_assert!(slot.is_active(), "released a slot that was not acquired");
        slot.release();
    }

    fn set(&self, slot: &Slot, ptr: *mut u8) {
        slot.protect(ptr);
    }

    unsafe fn retire<T: Retirable>(&self, ptr: *mut T, reclaim: unsafe fn(*mut T)) -> usize {
        unsafe { Domain::retire(self, ptr, reclaim) }
    }
}
