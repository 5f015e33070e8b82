use crate::sync::atomic::{AtomicPtr, Ordering};
use core::cell::UnsafeCell;

/// Intrusive bookkeeping that lets an object sit on a domain's retired list without any extra
/// allocation.
///
/// Embed one of these in every type you intend to retire, and expose it through [`Retirable`].
/// The header is inert until the object is retired, at which point the domain records the object's
/// address and the function that will reclaim it.
pub struct RetiredHeader {
    pub(crate) next: AtomicPtr<RetiredHeader>,
    object: UnsafeCell<*mut u8>,
    reclaim: UnsafeCell<unsafe fn(*mut u8)>,
}

// Safety: `object` and `reclaim` are written only by the retiring thread, before the header is
// published onto a retired list with a release CAS, and read only by the thread that detached the
// header from that list with an acquire swap.
unsafe impl Send for RetiredHeader {}
unsafe impl Sync for RetiredHeader {}

unsafe fn never_retired(_: *mut u8) {
    debug_assert!(false, "reclaimed an object that was never retired");
}

impl RetiredHeader {
    /// Create a header for an object that has not been retired yet.
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            object: UnsafeCell::new(core::ptr::null_mut()),
            reclaim: UnsafeCell::new(never_retired),
        }
    }

    /// # Safety
    ///
    /// The caller is the only thread retiring the object that embeds `self`, and the header is not
    /// currently on any retired list.
    pub(crate) unsafe fn prepare<T>(&self, object: *mut T, reclaim: unsafe fn(*mut T)) {
        // Safety: `*mut T` and `*mut u8` are ABI-compatible for sized `T`, so calling `reclaim`
        // through the erased signature with the address we store alongside it is sound.
        let reclaim =
            unsafe { core::mem::transmute::<unsafe fn(*mut T), unsafe fn(*mut u8)>(reclaim) };
        unsafe {
            *self.object.get() = object as *mut u8;
            *self.reclaim.get() = reclaim;
        }
        self.next.store(core::ptr::null_mut(), Ordering::Relaxed);
    }

    /// The address hazards are compared against.
    pub(crate) fn object(&self) -> *mut u8 {
        // Safety: only read by the thread that owns the detached header.
        unsafe { *self.object.get() }
    }

    /// Run the reclaim function recorded at retire time.
    ///
    /// # Safety
    ///
    /// `this` was detached from a retired list by the caller, and no hazard protects its object.
    /// The header must not be touched afterwards: it lives inside the object that was just freed.
    pub(crate) unsafe fn reclaim(this: *mut RetiredHeader) {
        let (object, reclaim) = unsafe {
            let header = &*this;
            (*header.object.get(), *header.reclaim.get())
        };
        unsafe { reclaim(object) };
    }
}

impl Default for RetiredHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RetiredHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetiredHeader").finish_non_exhaustive()
    }
}

/// Types that carry a [`RetiredHeader`] and can therefore be retired into a domain.
///
/// # Safety
///
/// `retired_header` must return a header that is stored inline in `self`, and must return the
/// same header on every call.
pub unsafe trait Retirable {
    /// The header the domain links this object through once it is retired.
    fn retired_header(&self) -> &RetiredHeader;
}

/// Reclaim functions to pass to `retire`.
pub mod deleters {
    use alloc::alloc::{dealloc, Layout};
    use alloc::boxed::Box;

    /// The byte pattern [`poison_box`] fills reclaimed memory with.
    pub const POISON: u8 = 0xAB;

    /// Reclaim an object that was allocated with [`Box`].
    ///
    /// # Safety
    ///
    /// `ptr` came from `Box::into_raw` and is not used again.
    pub unsafe fn drop_box<T>(ptr: *mut T) {
        let _ = unsafe { Box::from_raw(ptr) };
    }

    /// Like [`drop_box`], but overwrites the object's memory with [`POISON`] before freeing it.
    ///
    /// Useful when hunting use-after-free bugs: a reader that sees the poison pattern read through
    /// a pointer that was not (or no longer) protected.
    ///
    /// # Safety
    ///
    /// Same as [`drop_box`].
    pub unsafe fn poison_box<T>(ptr: *mut T) {
        let layout = Layout::new::<T>();
        unsafe {
            core::ptr::drop_in_place(ptr);
            core::ptr::write_bytes(ptr as *mut u8, POISON, layout.size());
        }
        if layout.size() != 0 {
            // Safety: Box allocates non-zero-sized values with the global allocator and exactly
            // this layout.
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}
