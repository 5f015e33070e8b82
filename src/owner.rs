use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::{Domain, Error, HazardDomain, Slot};
use crossbeam_utils::Backoff;

/// A type that can protect a referenced object from reclamation.
///
/// An owner binds exactly one hazard [`Slot`] of one domain for its entire lifetime, and protects
/// at most one address at a time. It does nothing when initially constructed. Load a pointer
/// through it with [`Owner::get_protected`] (or [`Owner::protect`]) in order for it to protect an
/// object; the moment the owner is reset, re-pointed, or dropped, that protection ends and the
/// slot goes back to the domain's free pool.
///
/// A protection only means something if every thread that may reclaim the object retires it into
/// the same domain the owner was made from.
///
/// Owners can be moved but not cloned. Swapping two owners with [`core::mem::swap`] swaps the
/// slots they hold, and each slot keeps protecting whatever it protected before.
pub struct Owner<'domain, D: HazardDomain = Domain> {
    slot: &'domain Slot,
    domain: &'domain D,
}

impl Owner<'static, Domain> {
    /// Create a new owner in the [global domain](Domain::global).
    ///
    /// The global domain is never dropped: whatever is still retired into it when the process
    /// exits is leaked. Use [`Owner::new_in`] with a domain of your own to have it reclaimed.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Owner::new_in(Domain::global())
    }
}

impl<'domain, D: HazardDomain> Owner<'domain, D> {
    /// Create a new owner in the given domain.
    ///
    /// Aborts through [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if a new slot
    /// is needed and cannot be allocated. Use [`Owner::try_new_in`] to handle that instead.
    ///
    /// # Panics
    ///
    /// If `domain` breaks the [`HazardDomain::acquire`] contract by failing with an error other
    /// than [`Error::OutOfMemory`].
    pub fn new_in(domain: &'domain D) -> Self {
        match Self::try_new_in(domain) {
            Ok(owner) => owner,
            Err(Error::OutOfMemory { layout }) => alloc::alloc::handle_alloc_error(layout),
            Err(e) => panic!("HazardDomain::acquire may only fail to allocate, but failed: {}", e),
        }
    }

    /// Create a new owner in the given domain, reporting allocation failure as an error.
    ///
    /// Any error from [`HazardDomain::acquire`] is passed through unchanged.
    pub fn try_new_in(domain: &'domain D) -> Result<Self, Error> {
        Ok(Self {
            slot: domain.acquire()?,
            domain,
        })
    }

    /// The domain this owner's slot belongs to.
    pub fn domain(&self) -> &'domain D {
        self.domain
    }

    /// Protect the given address.
    ///
    /// You will very rarely want to use this method, and should prefer the other protection
    /// methods instead, as they guard against races between when the value of a shared pointer
    /// was read and any changes to the shared pointer address.
    pub fn set<T>(&mut self, ptr: *const T) {
        self.domain.set(self.slot, ptr as *mut u8);
    }

    /// Release the protection awarded by this owner, if any.
    ///
    /// If the owner was protecting an object, that object may now be reclaimed when retired
    /// (assuming no _other_ owner protects it).
    pub fn reset(&mut self) {
        self.domain.set(self.slot, core::ptr::null_mut());
    }

    /// Try to protect `ptr`, which was loaded from `src`.
    ///
    /// Publishes `ptr` as hazarded, then re-reads `src`. If `src` still holds `ptr`, the object
    /// cannot have been retired before our hazard became visible, and it is now safe to
    /// dereference until this owner is reset or dropped. Otherwise the hazard is cleared and the
    /// fresh value of `src` is returned as `Err`, for the caller to retry with.
    ///
    /// Protecting a null pointer always succeeds if `src` is still null.
    pub fn try_protect<T>(&mut self, ptr: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        self.set(ptr);

        crate::sync::light_barrier();

        let ptr2 = src.load(Ordering::Acquire);
        if ptr != ptr2 {
            self.reset();
            Err(ptr2)
        } else {
            // All good -- protected
            Ok(())
        }
    }

    /// Load the pointer stored in `src` and protect it.
    ///
    /// This operation will load `src` multiple times:
    ///
    /// 1. load to get the currently stored pointer, `ptr`
    /// 2. store `ptr` into the hazard slot to protect it from reclamation
    /// 3. load again to check that the pointer didn't change between 1 and 2.
    ///    if it did, set the loaded value to `ptr` and goto 2.
    ///
    /// The returned pointer may be null. If it is not, it stays valid until this owner is reset,
    /// protects something else, or is dropped.
    pub fn get_protected<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let backoff = Backoff::new();
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            match self.try_protect(ptr, src) {
                Ok(()) => break ptr,
                Err(ptr2) => {
                    ptr = ptr2;
                    crate::sync::snooze(&backoff);
                }
            }
        }
    }

    /// Protect the value loaded from `src`, and dereference it to `&T`.
    ///
    /// The reference is tied to the exclusive borrow of this owner, so it cannot outlive the
    /// protection. Returns `None` if the loaded pointer is null.
    ///
    /// `T` must be `Sync` since we do not know which thread stored the pointer in the first place.
    ///
    /// # Safety
    ///
    /// 1. Every non-null value stored in `src` is valid as a `&T` until it is retired.
    /// 2. Values stored in `src` are only ever freed through `retire` on this owner's domain.
    pub unsafe fn protect<'l, T: Sync>(&'l mut self, src: &'_ AtomicPtr<T>) -> Option<&'l T> {
        let ptr = self.get_protected(src);
        // Safety: ptr is protected for as long as 'l, and valid by requirement #1.
        unsafe { ptr.as_ref() }
    }
}

impl<D: HazardDomain> Drop for Owner<'_, D> {
    fn drop(&mut self) {
        self.domain.release(self.slot);
    }
}

impl<D: HazardDomain> core::fmt::Debug for Owner<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Owner")
            .field("slot", &(self.slot as *const Slot))
            .field("protected", &self.slot.protected())
            .finish()
    }
}
