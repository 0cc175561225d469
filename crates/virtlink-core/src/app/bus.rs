//! Event Bus - per-object subscriber registry.
//!
//! `register` hands back a [`SubscriptionId`]; `unregister` takes it. Ids
//! are allocated in increasing order and kept in a `BTreeMap`, so iteration
//! order is registration order and removal is a map lookup, independent of
//! how the callback itself compares.
//!
//! ## Broadcast rules
//! - Callbacks run in registration order, synchronously, on the caller's
//!   (dispatch) context.
//! - The subscriber list is snapshotted before the first callback runs. A
//!   callback may unregister itself or others; the in-progress broadcast still
//!   reaches every callback in the snapshot, and later broadcasts see the change.
//! - No internal borrow is held while callbacks run.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::error;

use crate::error::{Error, Result};
use crate::model::SubscriptionId;
use crate::model::ids::{SeqAllocator, Subscription};

struct Subscriber<E> {
    label: String,
    callback: Rc<dyn Fn(&E)>,
}

/// Subscriber registry owned by a connection or resource.
pub struct EventBus<E> {
    owner: String,
    subscribers: RefCell<BTreeMap<SubscriptionId, Subscriber<E>>>,
    ids: SeqAllocator<Subscription>,
}

impl<E> EventBus<E> {
    /// `owner` names the bus in leak reports (e.g. "domain u1").
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            subscribers: RefCell::new(BTreeMap::new()),
            ids: SeqAllocator::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Adds `callback`. `label` identifies the subscriber in diagnostics.
    pub fn register<F>(&self, label: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + 'static,
    {
        let id = self.ids.allocate();
        self.subscribers.borrow_mut().insert(
            id,
            Subscriber {
                label: label.into(),
                callback: Rc::new(callback),
            },
        );
        id
    }

    pub fn unregister(&self, id: SubscriptionId) -> Result<()> {
        let removed = self.subscribers.borrow_mut().remove(&id);
        match removed {
            Some(_) => Ok(()),
            None => {
                error!(bus = %self.owner, subscription = %id, "unregister of unknown subscription");
                Err(Error::NotSubscribed(id))
            }
        }
    }

    pub fn is_registered(&self, id: SubscriptionId) -> bool {
        self.subscribers.borrow().contains_key(&id)
    }

    /// Delivers `event` to every subscriber registered when the call began.
    pub fn broadcast(&self, event: &E) {
        let snapshot: Vec<Rc<dyn Fn(&E)>> = self
            .subscribers
            .borrow()
            .values()
            .map(|s| Rc::clone(&s.callback))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Labels of current subscribers, in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.subscribers
            .borrow()
            .values()
            .map(|s| s.label.clone())
            .collect()
    }

    /// Leak check run right before the owner is destroyed.
    pub fn ensure_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let labels = self.labels();
        error!(bus = %self.owner, subscribers = ?labels, "subscriber leak");
        Err(Error::SubscriberLeak {
            owner: self.owner.clone(),
            labels,
        })
    }
}
