//! Queue-and-drain fan-out.
//!
//! Each subscriber owns a queue and a worker thread that drains it, so publishing never waits
//! on subscriber code and a slow subscriber only delays itself. Queues are FIFO, so every
//! subscriber sees notifications in publish order.
//!
//! Field snapshots coalesce while queued: a subscriber holds at most one pending snapshot per
//! field, and a newer one replaces it in place. A lagging subscriber therefore skips
//! intermediate revisions but never sees them out of order, and its backlog is bounded by the
//! number of fields. Every other notification is queued as-is.

use crate::models::field::{FieldId, FieldState};
use crate::models::notice::{Alert, Diagnostic};
use crate::models::wire::{ConnectionStatus, Recommendation};
use crate::services::store::FieldFilter;
use crate::services::subscription::{Detach, Registry, Subscription};
use crate::utils;
use crossbeam::channel::{self, Receiver, Sender};
use log::{error, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

#[derive(Debug, Clone)]
pub enum Notification {
    Field(Arc<FieldState>),
    Recommendation(Arc<Recommendation>),
    Status(ConnectionStatus),
    Diagnostic(Arc<Diagnostic>),
    Alert(Arc<Alert>),
}

/// Which notifications a subscriber receives. Status has its own topic so link health can be
/// shown independently of data freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Fields(FieldFilter),
    Recommendations,
    Status,
    Diagnostics,
    Alerts,
}

impl Topic {
    pub fn accepts(&self, notification: &Notification) -> bool {
        match (self, notification) {
            (Topic::Fields(filter), Notification::Field(state)) => filter.matches(&state.field_id),
            (Topic::Recommendations, Notification::Recommendation(_)) => true,
            (Topic::Status, Notification::Status(_)) => true,
            (Topic::Diagnostics, Notification::Diagnostic(_)) => true,
            (Topic::Alerts, Notification::Alert(_)) => true,
            _ => false,
        }
    }
}

enum Queued {
    Ready(Notification),
    /// The newest snapshot for this field waits in the queue's pending map.
    Field(FieldId),
}

type PendingFields = Arc<Mutex<HashMap<FieldId, Arc<FieldState>>>>;

#[derive(Clone)]
struct Queue {
    topic: Topic,
    active: Arc<AtomicBool>,
    tx: Sender<Queued>,
    pending: PendingFields,
}

impl Queue {
    fn offer(&self, notification: &Notification) -> bool {
        let Notification::Field(state) = notification else {
            return self.tx.send(Queued::Ready(notification.clone())).is_ok();
        };
        let mut pending = utils::lock(&self.pending);
        if let Some(slot) = pending.get_mut(&state.field_id) {
            *slot = Arc::clone(state);
            return true;
        }
        if self.tx.send(Queued::Field(state.field_id.clone())).is_err() {
            return false;
        }
        pending.insert(state.field_id.clone(), Arc::clone(state));
        true
    }
}

pub struct Dispatcher {
    queues: Registry<Queue>,
    queue_warn: usize,
}

impl Detach for Dispatcher {
    fn detach(&self, id: u64) {
        if let Some(queue) = self.queues.remove(id) {
            queue.active.store(false, Ordering::Release);
        }
    }
}

impl Dispatcher {
    /// `queue_warn`: backlog size at which a subscriber is reported as lagging (0 disables).
    pub fn new(queue_warn: usize) -> Arc<Self> {
        Arc::new(Dispatcher {
            queues: Registry::new(),
            queue_warn,
        })
    }

    pub fn subscribe<F>(self: &Arc<Self>, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let active = Arc::new(AtomicBool::new(true));
        let pending: PendingFields = Arc::new(Mutex::new(HashMap::new()));
        let id = self.queues.insert(Queue {
            topic,
            active: Arc::clone(&active),
            tx,
            pending: Arc::clone(&pending),
        });

        let worker_active = Arc::clone(&active);
        let spawned = thread::Builder::new()
            .name(format!("fanout-{}", id))
            .spawn(move || drain(id, rx, worker_active, pending, callback));
        if let Err(e) = spawned {
            error!("Subscriber {}: could not start delivery thread: {}", id, e);
            self.detach(id);
        }

        let me: Weak<Dispatcher> = Arc::downgrade(self);
        let owner: Weak<dyn Detach> = me;
        Subscription::new(id, owner, active)
    }

    /// Hands the notification to every matching queue and returns how many took it.
    pub fn publish(&self, notification: Notification) -> usize {
        let targets = self
            .queues
            .matching(|q| q.active.load(Ordering::Acquire) && q.topic.accepts(&notification));
        let mut delivered = 0;
        for target in targets {
            if target.offer(&notification) {
                delivered += 1;
            }
            let backlog = target.tx.len();
            if self.queue_warn > 0 && backlog >= self.queue_warn && backlog % self.queue_warn == 0 {
                warn!("Subscriber on {:?} is lagging: {} notification(s) queued", target.topic, backlog);
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.queues.len()
    }

    /// Detaches every subscriber. Workers finish the callback they are in and exit.
    pub fn close(&self) {
        for queue in self.queues.drain() {
            queue.active.store(false, Ordering::Release);
        }
    }
}

fn drain<F>(id: u64, rx: Receiver<Queued>, active: Arc<AtomicBool>, pending: PendingFields, callback: F)
where
    F: Fn(&Notification),
{
    for queued in rx.iter() {
        if !active.load(Ordering::Acquire) {
            break;
        }
        let notification = match queued {
            Queued::Ready(notification) => notification,
            Queued::Field(field_id) => {
                let latest = utils::lock(&pending).remove(&field_id);
                match latest {
                    Some(state) => Notification::Field(state),
                    None => continue,
                }
            }
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&notification)));
        if let Err(payload) = outcome {
            error!(
                "Subscriber {} panicked while handling a notification: {}",
                id,
                utils::panic_reason(&*payload)
            );
        }
    }
}
