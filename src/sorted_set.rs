use crate::retired::{deleters, Retirable, RetiredHeader};
use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::{Domain, Error, HazardDomain, Owner};
use alloc::boxed::Box;
use core::cmp::Ordering as KeyOrdering;
use core::marker::PhantomData;

struct Node<K> {
    header: RetiredHeader,
    key: K,
    next: AtomicPtr<Node<K>>,
}

unsafe impl<K> Retirable for Node<K> {
    fn retired_header(&self) -> &RetiredHeader {
        &self.header
    }
}

/// A set kept as a sorted singly-linked list, with one writer and any number of concurrent
/// readers.
///
/// Readers call [`SortedSet::contains`] from any thread without blocking. Mutation goes through a
/// [`SetWriter`], of which at most one exists at a time; claiming it is the only synchronisation
/// between writers, so individual inserts and removals are plain stores.
///
/// Removed nodes are retired into the set's domain.
pub struct SortedSet<'domain, K, D: HazardDomain = Domain> {
    head: AtomicPtr<Node<K>>,
    writer: AtomicBool,
    domain: &'domain D,
}

// Safety: keys are dropped by whichever thread reclaims them, and compared from many threads.
unsafe impl<K: Send + Sync, D: HazardDomain> Send for SortedSet<'_, K, D> {}
unsafe impl<K: Send + Sync, D: HazardDomain> Sync for SortedSet<'_, K, D> {}

impl<K: Ord + Send + Sync + 'static> SortedSet<'static, K, Domain> {
    /// Create an empty set whose nodes are reclaimed through the [global domain](Domain::global).
    ///
    /// The global domain is never dropped: whatever is still retired into it when the process
    /// exits is leaked. Use [`SortedSet::new_in`] with a domain of your own to have it reclaimed.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        SortedSet::new_in(Domain::global())
    }
}

impl<'domain, K: Ord + Send + Sync + 'domain, D: HazardDomain> SortedSet<'domain, K, D> {
    /// Create an empty set whose nodes are reclaimed through `domain`.
    pub fn new_in(domain: &'domain D) -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            writer: AtomicBool::new(false),
            domain,
        }
    }

    /// Claim the right to modify the set.
    ///
    /// Returns [`Error::WriterActive`] if another [`SetWriter`] is still alive.
    pub fn writer(&self) -> Result<SetWriter<'_, 'domain, K, D>, Error> {
        self.writer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::WriterActive)?;
        Ok(SetWriter {
            set: self,
            _not_sync: PhantomData,
        })
    }

    /// Returns `true` if `key` was in the set at some point during the call.
    ///
    /// Walks the list hand-over-hand with two hazards, one on the node whose link we are reading
    /// and one on the node it points to. If the writer unlinks either of them under us, the walk
    /// starts over from the head.
    pub fn contains(&self, key: &K) -> bool {
        let mut prev_owner = Owner::new_in(self.domain);
        let mut curr_owner = Owner::new_in(self.domain);
        'walk: loop {
            // The link we follow, and the node currently protected by prev_owner that holds it
            // (or the head itself).
            let mut prev: *const AtomicPtr<Node<K>> = &self.head;
            // Safety: prev is the head, which lives as long as self.
            let mut curr = unsafe { &*prev }.load(Ordering::Acquire);
            loop {
                if curr.is_null() {
                    return false;
                }
                // Safety: prev is either the head or the `next` field of a node protected by
                // prev_owner.
                let link = unsafe { &*prev };
                // If curr was unlinked, the link now points past it; if the node holding the link
                // was unlinked, the link is null. Either way we have walked off the list.
                if curr_owner.try_protect(curr, link).is_err() {
                    continue 'walk;
                }
                // Safety: curr is protected, and was reachable when we protected it.
                let node = unsafe { &*curr };
                let next = node.next.load(Ordering::Acquire);
                // A removed node has its `next` nulled, but only after the link before it was
                // patched, so the null is only trusted if the link still points at us.
                if next.is_null() && link.load(Ordering::Acquire) != curr {
                    continue 'walk;
                }
                match node.key.cmp(key) {
                    KeyOrdering::Equal => return true,
                    KeyOrdering::Greater => return false,
                    KeyOrdering::Less => {}
                }
                prev = &node.next;
                curr = next;
                // Now prev_owner protects the node that holds `prev`.
                core::mem::swap(&mut prev_owner, &mut curr_owner);
            }
        }
    }

    /// The link that points at the first node whose key is not less than `key`, and that node.
    ///
    /// Only the writer may call this: it relies on nothing being unlinked concurrently.
    fn locate(&self, key: &K) -> (&AtomicPtr<Node<K>>, *mut Node<K>) {
        let mut prev = &self.head;
        let mut curr = prev.load(Ordering::Acquire);
        // Safety: only the writer retires nodes, so every node reachable from head stays valid.
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.key >= *key {
                break;
            }
            prev = &node.next;
            curr = prev.load(Ordering::Acquire);
        }
        (prev, curr)
    }
}

impl<K, D: HazardDomain> Drop for SortedSet<'_, K, D> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: &mut self means no readers or writer, and linked nodes were never retired.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

impl<K, D: HazardDomain> core::fmt::Debug for SortedSet<'_, K, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SortedSet")
            .field("writer_active", &self.writer.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Exclusive write access to a [`SortedSet`].
///
/// Created by [`SortedSet::writer`]. Dropping it lets another writer be claimed. A writer may be
/// sent to another thread, but not shared between threads.
pub struct SetWriter<'set, 'domain, K, D: HazardDomain = Domain> {
    set: &'set SortedSet<'domain, K, D>,
    _not_sync: PhantomData<core::cell::Cell<()>>,
}

impl<'set, 'domain, K, D> SetWriter<'set, 'domain, K, D>
where
    K: Ord + Send + Sync + 'domain,
    D: HazardDomain,
{
    /// Insert `key`. Returns `false`, leaving the set unchanged, if it was already present.
    pub fn add(&mut self, key: K) -> bool {
        let (prev, curr) = self.set.locate(&key);
        // Safety: we are the writer, so curr cannot be retired under us.
        if let Some(node) = unsafe { curr.as_ref() } {
            if node.key == key {
                return false;
            }
        }
        let node = Box::into_raw(Box::new(Node {
            header: RetiredHeader::new(),
            key,
            next: AtomicPtr::new(curr),
        }));
        // The node is fully built before this store makes it reachable.
        prev.store(node, Ordering::Release);
        true
    }

    /// Remove `key`. Returns `false` if it was not in the set.
    pub fn remove(&mut self, key: &K) -> bool {
        let (prev, curr) = self.set.locate(key);
        // Safety: we are the writer, so curr cannot be retired under us.
        let node = match unsafe { curr.as_ref() } {
            Some(node) if node.key == *key => node,
            _ => return false,
        };
        let next = node.next.load(Ordering::Acquire);
        // Unlink first, then cut the removed node off, then retire it.
        prev.store(next, Ordering::Release);
        node.next.store(core::ptr::null_mut(), Ordering::Release);
        // Safety:
        //
        //  1. curr is no longer reachable from head.
        //  2. only the writer retires nodes, and it unlinked curr just now.
        //  3. curr came from Box::into_raw in add.
        unsafe { self.set.domain.retire(curr, deleters::drop_box::<Node<K>>) };
        true
    }

    /// The set this writer modifies.
    pub fn set(&self) -> &'set SortedSet<'domain, K, D> {
        self.set
    }
}

impl<K, D: HazardDomain> Drop for SetWriter<'_, '_, K, D> {
    fn drop(&mut self) {
        self.set.writer.store(false, Ordering::Release);
    }
}
