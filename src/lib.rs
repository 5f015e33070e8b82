//! Hazard pointer memory reclamation, and a few lock-free structures built on top of it.
//!
//! When a lock-free structure unlinks a node, some other thread may still be reading it. The node
//! cannot be freed right away, but nobody is in a position to say when it is safe to free it
//! either. [Hazard pointers][hazptr] solve this: readers publish the address they are about to
//! dereference in a per-thread _slot_, and writers hand unlinked objects to a [`Domain`] instead of
//! freeing them (they _retire_ them). Every so often the domain collects the published addresses
//! and _reclaims_ every retired object that nobody protects.
//!
//! Readers never block, and never touch a shared counter. Reclamation is batched: a scan is only
//! attempted once the number of pending objects reaches [`THRESHOLD_FACTOR`] times the number of
//! slots, which keeps the amortised cost of a `retire` constant.
//!
//! # Reading
//!
//! An [`Owner`] holds one slot of a domain for as long as it lives. To read a shared pointer, load
//! it through the owner:
//!
//! ```
//! use hazel::{Domain, Owner};
//! use std::sync::atomic::AtomicPtr;
//!
//! let domain = Domain::new();
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(7u32)));
//!
//! let mut owner = Owner::new_in(&domain);
//! let ptr = owner.get_protected(&shared);
//! // ptr cannot be reclaimed by `domain` until owner is reset or dropped.
//! assert_eq!(unsafe { *ptr }, 7);
//! # drop(owner);
//! # drop(unsafe { Box::from_raw(ptr) });
//! ```
//!
//! # Retiring
//!
//! Objects that are retired embed a [`RetiredHeader`] and implement [`Retirable`], so the domain
//! can keep them on a list without allocating. Once an object is unreachable, pass it to
//! [`Domain::retire`] along with the function that frees it, usually one of the
//! [`deleters`].
//!
//! # Structures
//!
//! - [`Stack`]: a Treiber stack whose `pop` uses a hazard to avoid ABA and use-after-free.
//! - [`SortedSet`]: a sorted linked list with one [writer](SetWriter) and wait-free-ish readers.
//! - [`Cell`]: a value that can be replaced atomically while readers keep [`SnapshotPtr`]s of older
//!   values.
//!
//! All of them take the domain to use as a generic parameter, [`Domain`] by default, bounded by
//! [`HazardDomain`].
//!
//! [hazptr]: https://citeseerx.ist.psu.edu/viewdoc/download?doi=10.1.1.395.378&rep=rep1&type=pdf

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod cell;
mod domain;
mod error;
mod owner;
mod retired;
mod slot;
mod sorted_set;
mod stack;
mod sync;

pub use cell::{Cell, SharedSnapshot, SnapshotPtr};
pub use domain::{Domain, HazardDomain, THRESHOLD_FACTOR};
pub use error::Error;
pub use owner::Owner;
pub use retired::{deleters, Retirable, RetiredHeader};
pub use slot::Slot;
pub use sorted_set::{SetWriter, SortedSet};
pub use stack::Stack;
