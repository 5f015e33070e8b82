#[cfg(all(not(feature = "std"), loom))]
compile_error!("loom requires the standard library");

#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
}
#[cfg(loom)]
pub(crate) use loom::thread::yield_now;

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
}

/// Orders a hazard store before the reload that validates it.
pub(crate) fn light_barrier() {
    atomic::fence(atomic::Ordering::SeqCst);
}

/// Orders detaching a retired batch before reading the hazard slots.
pub(crate) fn heavy_barrier() {
    atomic::fence(atomic::Ordering::SeqCst);
}

/// Wait a little before retrying a failed CAS.
///
/// loom needs to be told about every spin so that it can schedule the thread we're waiting on.
#[cfg(loom)]
pub(crate) fn snooze(_: &crossbeam_utils::Backoff) {
    yield_now();
}

#[cfg(not(loom))]
pub(crate) fn snooze(backoff: &crossbeam_utils::Backoff) {
    backoff.spin();
}

// Make AtomicPtr usable with loom API.
#[cfg(not(loom))]
pub(crate) trait WithMut<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R;
}
#[cfg(not(loom))]
impl<T> WithMut<T> for core::sync::atomic::AtomicPtr<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R {
        f(self.get_mut())
    }
}
