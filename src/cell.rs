use crate::retired::{deleters, Retirable, RetiredHeader};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::{Domain, HazardDomain, Owner};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::Deref;
use core::ptr::NonNull;

struct ControlBlock<T> {
    header: RetiredHeader,
    value: T,
}

unsafe impl<T> Retirable for ControlBlock<T> {
    fn retired_header(&self) -> &RetiredHeader {
        &self.header
    }
}

/// A shared slot that is either empty or holds one value, which can be replaced atomically while
/// readers hold on to [snapshots](SnapshotPtr) of older values.
///
/// Reading never blocks and never copies the value: [`Cell::get_snapshot`] protects the current
/// value with a hazard and hands out a pointer to it. Replacing the value with [`Cell::update`]
/// retires the old one into the cell's domain, where it stays alive until the last snapshot of it
/// is dropped.
///
/// ```
/// let domain = hazel::Domain::new();
/// let cell = hazel::Cell::new_in(&domain, Some(42));
///
/// let old = cell.get_snapshot().expect("cell is not empty");
/// cell.update(Some(99));
///
/// assert_eq!(*old, 42);
/// assert_eq!(*cell.get_snapshot().unwrap(), 99);
/// ```
pub struct Cell<'domain, T, D: HazardDomain = Domain> {
    current: AtomicPtr<ControlBlock<T>>,
    domain: &'domain D,
}

// Safety: values are read from many threads, and dropped by whichever thread reclaims them.
unsafe impl<T: Send + Sync, D: HazardDomain> Send for Cell<'_, T, D> {}
unsafe impl<T: Send + Sync, D: HazardDomain> Sync for Cell<'_, T, D> {}

impl<T: Send + Sync + 'static> Cell<'static, T, Domain> {
    /// Create a cell whose old values are reclaimed through the [global domain](Domain::global).
    ///
    /// The global domain is never dropped: whatever is still retired into it when the process
    /// exits is leaked. Use [`Cell::new_in`] with a domain of your own to have it reclaimed.
    pub fn new(value: Option<T>) -> Self {
        Cell::new_in(Domain::global(), value)
    }
}

impl<'domain, T: Send + Sync + 'domain, D: HazardDomain> Cell<'domain, T, D> {
    /// Create a cell whose old values are reclaimed through `domain`.
    pub fn new_in(domain: &'domain D, value: Option<T>) -> Self {
        Self {
            current: AtomicPtr::new(Self::control_block(value)),
            domain,
        }
    }

    fn control_block(value: Option<T>) -> *mut ControlBlock<T> {
        match value {
            Some(value) => Box::into_raw(Box::new(ControlBlock {
                header: RetiredHeader::new(),
                value,
            })),
            None => core::ptr::null_mut(),
        }
    }

    /// Replace the cell's value, or empty it with `None`.
    ///
    /// The previous value is retired, not dropped: snapshots taken before the update keep seeing
    /// it until they are dropped.
    pub fn update(&self, value: Option<T>) {
        let new = Self::control_block(value);
        let old = self.current.swap(new, Ordering::AcqRel);
        if !old.is_null() {
            // Safety:
            //
            //  1. old is no longer reachable through the cell.
            //  2. only the thread whose swap returned old retires it.
            //  3. old came from Box::into_raw in control_block.
            unsafe { self.domain.retire(old, deleters::drop_box::<ControlBlock<T>>) };
        }
    }

    /// Take a snapshot of the current value, or `None` if the cell is empty.
    ///
    /// The snapshot stays valid, and the value it points to stays unchanged, for as long as the
    /// snapshot lives, no matter how the cell is updated in the meantime.
    pub fn get_snapshot(&self) -> Option<SnapshotPtr<'domain, T, D>> {
        let mut owner = Owner::new_in(self.domain);
        let cb = NonNull::new(owner.get_protected(&self.current))?;
        // Safety: cb is protected by owner, which moves into the snapshot.
        let value = unsafe { NonNull::from(&(*cb.as_ptr()).value) };
        Some(SnapshotPtr { value, owner })
    }

    /// Returns `true` if the cell held no value when it was checked.
    pub fn is_empty(&self) -> bool {
        self.current.load(Ordering::Acquire).is_null()
    }
}

impl<T, D: HazardDomain> Drop for Cell<'_, T, D> {
    fn drop(&mut self) {
        let last = self.current.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if !last.is_null() {
            // Safety: as in update. Snapshots of the last value may still be alive, so it has to
            // go through the domain rather than being dropped here.
            unsafe { self.domain.retire(last, deleters::drop_box::<ControlBlock<T>>) };
        }
    }
}

impl<T, D: HazardDomain> core::fmt::Debug for Cell<'_, T, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cell")
            .field("current", &self.current.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A handle to a value read from a [`Cell`], kept alive by a hazard it owns.
///
/// A snapshot always points at a live value. It cannot be copied or cloned, since its validity
/// is tied to the one hazard slot it holds; dropping it releases that slot. To share a snapshot
/// between several owners, convert it with [`SnapshotPtr::into_shared`].
pub struct SnapshotPtr<'domain, T, D: HazardDomain = Domain> {
    value: NonNull<T>,
    owner: Owner<'domain, D>,
}

// Safety: a snapshot only hands out `&T`.
unsafe impl<T: Sync, D: HazardDomain> Send for SnapshotPtr<'_, T, D> {}
unsafe impl<T: Sync, D: HazardDomain> Sync for SnapshotPtr<'_, T, D> {}

impl<'domain, T, D: HazardDomain> SnapshotPtr<'domain, T, D> {
    /// Returns `true` if both snapshots point at the same value (taken between the same two
    /// updates).
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.value == other.value
    }

    /// Move this snapshot into a reference-counted handle that can be cloned and shared.
    ///
    /// The hazard is then held until the last clone is dropped, which may be much later than a
    /// single snapshot would have held it. Old values pile up in the domain for as long as that
    /// is, so reach for this only when shared ownership is really needed.
    pub fn into_shared(self) -> SharedSnapshot<'domain, T, D> {
        SharedSnapshot(Arc::new(self))
    }

    /// The owner whose hazard keeps the value alive.
    pub fn owner(&self) -> &Owner<'domain, D> {
        &self.owner
    }
}

impl<T, D: HazardDomain> Deref for SnapshotPtr<'_, T, D> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // Safety: owner protects the control block holding value for as long as self lives.
        unsafe { self.value.as_ref() }
    }
}

impl<T: core::fmt::Debug, D: HazardDomain> core::fmt::Debug for SnapshotPtr<'_, T, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SnapshotPtr").field(&**self).finish()
    }
}

/// A reference-counted [`SnapshotPtr`], created by [`SnapshotPtr::into_shared`].
pub struct SharedSnapshot<'domain, T, D: HazardDomain = Domain>(Arc<SnapshotPtr<'domain, T, D>>);

impl<T, D: HazardDomain> Clone for SharedSnapshot<'_, T, D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T, D: HazardDomain> Deref for SharedSnapshot<'_, T, D> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: core::fmt::Debug, D: HazardDomain> core::fmt::Debug for SharedSnapshot<'_, T, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SharedSnapshot").field(&**self).finish()
    }
}
