use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// A single hazard record.
///
/// Slots are owned by their [`Domain`](crate::Domain) and are never deallocated while it lives, so
/// an [`Owner`](crate::Owner) may hold a plain `&Slot` for as long as it borrows the domain.
pub struct Slot {
    pub(crate) protected: AtomicPtr<u8>,
    pub(crate) active: AtomicBool,
    pub(crate) next: AtomicPtr<Slot>,
}

impl Slot {
    pub(crate) fn new_active() -> Self {
        Self {
            protected: AtomicPtr::new(core::ptr::null_mut()),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub(crate) fn protect(&self, ptr: *mut u8) {
        self.protected.store(ptr, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.protected.store(core::ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn protected(&self) -> *mut u8 {
        self.protected.load(Ordering::Acquire)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let active = self.active.load(Ordering::Acquire);
        !active
            && self
                .active
                .compare_exchange(active, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn release(&self) {
        self.reset();
        self.active.store(false, Ordering::Release);
    }
}
