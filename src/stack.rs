use crate::retired::{deleters, Retirable, RetiredHeader};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::{Domain, Error, HazardDomain, Owner};
use alloc::boxed::Box;
use core::mem::ManuallyDrop;
use crossbeam_utils::{Backoff, CachePadded};

struct Node<T> {
    header: RetiredHeader,
    value: ManuallyDrop<T>,
    next: *mut Node<T>,
}

unsafe impl<T> Retirable for Node<T> {
    fn retired_header(&self) -> &RetiredHeader {
        &self.header
    }
}

/// A lock-free LIFO stack (a Treiber stack) whose popped nodes are reclaimed through a hazard
/// pointer [`Domain`].
///
/// Popping protects the head node before reading its successor, so a node can never be freed (or
/// reused at the same address) under a concurrent pop, and the stack does not suffer from ABA.
///
/// Popped nodes are retired into the stack's domain, which may outlive the stack itself; that is
/// why values have to outlive the domain.
pub struct Stack<'domain, T, D: HazardDomain = Domain> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    domain: &'domain D,
}

// Safety: values are moved in on one thread and out (or dropped) on another.
unsafe impl<T: Send, D: HazardDomain> Send for Stack<'_, T, D> {}
unsafe impl<T: Send, D: HazardDomain> Sync for Stack<'_, T, D> {}

impl<T: Send + 'static> Stack<'static, T, Domain> {
    /// Create an empty stack whose nodes are reclaimed through the [global domain](Domain::global).
    ///
    /// The global domain is never dropped: whatever is still retired into it when the process
    /// exits is leaked. Use [`Stack::new_in`] with a domain of your own to have it reclaimed.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Stack::new_in(Domain::global())
    }
}

impl<'domain, T: Send + 'domain, D: HazardDomain> Stack<'domain, T, D> {
    /// Create an empty stack whose nodes are reclaimed through `domain`.
    pub fn new_in(domain: &'domain D) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
            domain,
        }
    }

    /// Push `value` onto the top of the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            header: RetiredHeader::new(),
            value: ManuallyDrop::new(value),
            next: core::ptr::null_mut(),
        }));

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: node has not been published yet, so we still have exclusive access.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(head_now) => {
                    head = head_now;
                    crate::sync::snooze(&backoff);
                }
            }
        }
    }

    /// Pop the value on top of the stack.
    ///
    /// Returns [`Error::Empty`] if the stack has no elements, or [`Error::OutOfMemory`] if a
    /// hazard slot was needed and could not be allocated.
    pub fn pop(&self) -> Result<T, Error> {
        let mut owner = Owner::try_new_in(self.domain)?;
        let backoff = Backoff::new();
        let mut node = self.head.load(Ordering::Acquire);
        loop {
            if node.is_null() {
                return Err(Error::Empty);
            }
            if let Err(head_now) = owner.try_protect(node, &self.head) {
                node = head_now;
                continue;
            }
            // Safety: node is protected, and `next` is never written after the node is published.
            let next = unsafe { (*node).next };
            match self
                .head
                .compare_exchange_weak(node, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(head_now) => {
                    node = head_now;
                    crate::sync::snooze(&backoff);
                }
            }
        }

        // We unlinked node, so nobody else will take its value or retire it.
        owner.reset();
        // Safety: concurrent poppers may still read `next` through their own hazards, but never
        // touch `value`. Reading it without forming a `&mut Node` leaves them undisturbed.
        let value = unsafe { ManuallyDrop::into_inner(core::ptr::read(&(*node).value)) };
        // Safety:
        //
        //  1. node is no longer reachable from head.
        //  2. only the thread that won the CAS retires it.
        //  3. node came from Box::into_raw in push, and its value has been moved out, which
        //     ManuallyDrop keeps the box deleter from dropping again.
        unsafe { self.domain.retire(node, deleters::drop_box::<Node<T>>) };
        Ok(value)
    }

    /// Returns `true` if the stack had no elements when it was checked.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T, D: HazardDomain> Drop for Stack<'_, T, D> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // Safety: &mut self means no concurrent pops, and nodes still on the stack were never
            // retired.
            let mut boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
        }
    }
}

impl<T, D: HazardDomain> core::fmt::Debug for Stack<'_, T, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Stack;
    use crate::{Domain, Error};

    #[test]
    fn lifo_order() {
        let domain = Domain::new();
        let stack = Stack::new_in(&domain);
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), Err(Error::Empty));

        for i in 0..10 {
            stack.push(i);
        }
        assert!(!stack.is_empty());
        for i in (0..10).rev() {
            assert_eq!(stack.pop(), Ok(i));
        }
        assert_eq!(stack.pop(), Err(Error::Empty));
    }

    #[test]
    fn popped_nodes_are_retired() {
        let domain = Domain::new();
        let stack = Stack::new_in(&domain);
        stack.push(String::from("a"));
        stack.push(String::from("b"));

        assert_eq!(stack.pop().as_deref(), Ok("b"));
        assert_eq!(stack.pop().as_deref(), Ok("a"));
        // Both pops reused one slot, so two retired nodes stay below the threshold of three.
        assert_eq!(domain.slot_count(), 1);
        assert_eq!(domain.retired_count(), 2);
        assert_eq!(domain.eager_reclaim(), 2);
    }

    #[test]
    fn drop_frees_remaining_values() {
        use std::sync::Arc;

        let domain = Domain::new();
        let value = Arc::new(());
        {
            let stack = Stack::new_in(&domain);
            for _ in 0..5 {
                stack.push(Arc::clone(&value));
            }
            drop(stack.pop());
            assert_eq!(Arc::strong_count(&value), 5);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
