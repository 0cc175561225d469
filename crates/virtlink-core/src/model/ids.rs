//! Strongly-typed identifiers.
//!
//! `Id<T>` carries a phantom marker so a `JobId` can never be passed where a
//! `SubscriptionId` is expected. Two representations are used:
//!
//! - **ULID** (`JobId`): generated on the dispatch context and logged from
//!   worker threads, so it has to be unique without coordination and sortable
//!   by creation time for log correlation.
//! - **Sequence** (`SubscriptionId`, `ChannelId`): allocated from a per-owner
//!   counter. Ordering by value equals ordering by allocation, which the event
//!   bus relies on to deliver in registration order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id family.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` (e.g. "job-").
    fn prefix() -> &'static str;
}

/// ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the current time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Sequence-backed identifier. Values are only meaningful within the
/// allocator that produced them.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seq<T: IdMarker> {
    value: u64,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Seq<T> {
    pub(crate) fn new(value: u64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl<T: IdMarker> fmt::Display for Seq<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

/// Monotonic allocator for `Seq<T>`. Single-threaded by construction: it
/// lives inside dispatch-context state.
#[derive(Debug)]
pub(crate) struct SeqAllocator<T: IdMarker> {
    next: std::cell::Cell<u64>,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> SeqAllocator<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: std::cell::Cell::new(1),
            _marker: PhantomData,
        }
    }

    pub(crate) fn allocate(&self) -> Seq<T> {
        let value = self.next.get();
        self.next.set(value + 1);
        Seq::new(value)
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {}

impl IdMarker for Subscription {
    fn prefix() -> &'static str {
        "sub-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {}

impl IdMarker for Channel {
    fn prefix() -> &'static str {
        "chan-"
    }
}

/// One unit of work handed to the Deferred Job Runner.
pub type JobId = Id<Job>;

/// Token returned by `EventBus::register`.
pub type SubscriptionId = Seq<Subscription>;

/// Persistent worker-to-dispatch signal route.
pub type ChannelId = Seq<Channel>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_family_prefix() {
        let job = JobId::generate();
        assert!(job.to_string().starts_with("job-"));

        let subs = SeqAllocator::<Subscription>::new();
        assert_eq!(subs.allocate().to_string(), "sub-1");
        assert_eq!(subs.allocate().to_string(), "sub-2");
    }

    #[test]
    fn sequence_order_matches_allocation_order() {
        let alloc = SeqAllocator::<Channel>::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        let c = alloc.allocate();
        assert!(a < b && b < c);
    }

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn job_ids_can_be_serialized() {
        let id = JobId::generate();
        let s = serde_json::to_string(&id).unwrap();
        let back: JobId = serde_json::from_str(&s).unwrap();
        assert_eq!(id, back);
    }
}
