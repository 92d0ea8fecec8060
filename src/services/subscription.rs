//! Subscription handles shared by the store and the fan-out dispatcher.

use crate::utils;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Something that can forget a subscriber by id.
pub(crate) trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

/// Returned by every subscribe call. Dropping the handle does not unsubscribe.
#[must_use = "keep the handle to be able to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    owner: Weak<dyn Detach>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(id: u64, owner: Weak<dyn Detach>, active: Arc<AtomicBool>) -> Self {
        Subscription { id, owner, active }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Immediately effective for any dispatch that has not yet looked the subscriber up.
    /// Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.id);
        }
    }
}

/// Id-keyed subscriber table.
pub(crate) struct Registry<S> {
    next_id: AtomicU64,
    entries: RwLock<BTreeMap<u64, S>>,
}

impl<S: Clone> Registry<S> {
    pub(crate) fn new() -> Self {
        Registry {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, entry: S) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        utils::write(&self.entries).insert(id, entry);
        id
    }

    pub(crate) fn remove(&self, id: u64) -> Option<S> {
        utils::write(&self.entries).remove(&id)
    }

    /// Clones matching entries out so callers never run subscriber code under the lock.
    pub(crate) fn matching(&self, mut pred: impl FnMut(&S) -> bool) -> Vec<S> {
        utils::read(&self.entries).values().filter(|s| pred(s)).cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<S> {
        std::mem::take(&mut *utils::write(&self.entries)).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        utils::read(&self.entries).len()
    }
}
