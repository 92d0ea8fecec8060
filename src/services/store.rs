//! Field state store: the single owner of per-field sensor state.
//!
//! - Every merge builds a new `FieldState` and swaps it in; readers only ever clone an `Arc`.
//! - Merges for one field are serialized by a per-field mutex. Different fields do not contend
//!   beyond the short map lookup.
//! - Subscribers run synchronously on the merging thread, after the swap, in merge order.
//!   A callback must not merge into the field it is being notified about. A panicking callback
//!   is logged and skipped; the merge and the remaining subscribers are unaffected.

use crate::models::field::{FieldId, FieldState, InvalidFieldIdError, SensorSlot};
use crate::models::reading::{RangeTable, Reading};
use crate::services::subscription::{Detach, Registry, Subscription};
use crate::utils;
use chrono::Utc;
use log::{debug, error};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

pub type SnapshotCallback = Arc<dyn Fn(&Arc<FieldState>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFilter {
    All,
    Field(FieldId),
}

impl FieldFilter {
    pub fn matches(&self, field_id: &FieldId) -> bool {
        match self {
            FieldFilter::All => true,
            FieldFilter::Field(id) => id == field_id,
        }
    }
}

/// What one merge call applies to a field.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldUpdate<'a> {
    pub readings: &'a [Reading],
    pub battery_level: Option<f64>,
    pub mac_address: Option<&'a str>,
    pub phase: Option<&'a str>,
}

impl<'a> FieldUpdate<'a> {
    pub fn readings(readings: &'a [Reading]) -> Self {
        FieldUpdate {
            readings,
            ..Default::default()
        }
    }
}

/// The two sides of one merge. Equal when the update carried nothing to apply.
#[derive(Debug, Clone)]
pub struct MergedState {
    pub before: Arc<FieldState>,
    pub after: Arc<FieldState>,
}

#[derive(Clone)]
struct StoreSubscriber {
    filter: FieldFilter,
    active: Arc<AtomicBool>,
    callback: SnapshotCallback,
}

struct FieldCell {
    merge: Mutex<()>,
    snapshot: RwLock<Arc<FieldState>>,
}

struct StoreInner {
    fields: RwLock<HashMap<FieldId, Arc<FieldCell>>>,
    subscribers: Registry<StoreSubscriber>,
}

impl Detach for StoreInner {
    fn detach(&self, id: u64) {
        self.subscribers.remove(id);
    }
}

#[derive(Clone)]
pub struct FieldStateStore {
    inner: Arc<StoreInner>,
}

impl Default for FieldStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldStateStore {
    pub fn new() -> Self {
        FieldStateStore {
            inner: Arc::new(StoreInner {
                fields: RwLock::new(HashMap::new()),
                subscribers: Registry::new(),
            }),
        }
    }

    /// Last-write-wins by arrival order: every reading overwrites its slot regardless of
    /// `observed_at`. Returns the snapshot now visible to readers.
    pub fn merge(
        &self,
        field_id: &str,
        update: FieldUpdate<'_>,
        ranges: &RangeTable,
    ) -> Result<Arc<FieldState>, InvalidFieldIdError> {
        self.merge_tracked(field_id, update, ranges).map(|m| m.after)
    }

    /// Like [`merge`](Self::merge), but also hands back the snapshot this merge replaced. Both
    /// are taken under the field's merge lock, so no other writer sits between them.
    pub fn merge_tracked(
        &self,
        field_id: &str,
        update: FieldUpdate<'_>,
        ranges: &RangeTable,
    ) -> Result<MergedState, InvalidFieldIdError> {
        let id = FieldId::new(field_id)?;
        let cell = self.cell_for(&id);
        let _merging = utils::lock(&cell.merge);

        let previous = Arc::clone(&utils::read(&cell.snapshot));
        let mut next = (*previous).clone();
        let mut applied = false;

        for reading in update.readings {
            if !reading.value.is_finite() {
                debug!("Field {}: skipping non-finite {} reading", id, reading.sensor_type);
                continue;
            }
            let optimal = next
                .readings
                .get(&reading.sensor_type)
                .and_then(|slot| slot.optimal)
                .or_else(|| ranges.optimal(reading.sensor_type));
            next.readings.insert(
                reading.sensor_type,
                SensorSlot {
                    current: reading.clone(),
                    optimal,
                },
            );
            applied = true;
        }

        if let Some(level) = update.battery_level.filter(|l| l.is_finite()) {
            next.battery_level = Some(level);
            applied = true;
        }

        if !applied {
            return Ok(MergedState {
                after: Arc::clone(&previous),
                before: previous,
            });
        }

        if let Some(mac) = update.mac_address {
            next.mac_address = Some(mac.to_string());
        }
        if let Some(phase) = update.phase {
            next.phase = Some(phase.to_string());
        }
        next.last_updated = Some(Utc::now());
        next.revision += 1;

        let snapshot = Arc::new(next);
        *utils::write(&cell.snapshot) = Arc::clone(&snapshot);
        self.notify(&snapshot);

        Ok(MergedState {
            before: previous,
            after: snapshot,
        })
    }

    /// Unseen fields yield the empty state, not an error.
    pub fn get(&self, field_id: &str) -> Result<Arc<FieldState>, InvalidFieldIdError> {
        let id = FieldId::new(field_id)?;
        let cell = utils::read(&self.inner.fields).get(&id).cloned();
        Ok(match cell {
            Some(cell) => Arc::clone(&utils::read(&cell.snapshot)),
            None => Arc::new(FieldState::empty(id)),
        })
    }

    pub fn subscribe<F>(&self, filter: FieldFilter, callback: F) -> Subscription
    where
        F: Fn(&Arc<FieldState>) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let id = self.inner.subscribers.insert(StoreSubscriber {
            filter,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });
        let inner: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let owner: Weak<dyn Detach> = inner;
        Subscription::new(id, owner, active)
    }

    pub fn field_ids(&self) -> Vec<FieldId> {
        let mut ids: Vec<FieldId> = utils::read(&self.inner.fields).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshots(&self) -> Vec<Arc<FieldState>> {
        let cells: Vec<Arc<FieldCell>> = utils::read(&self.inner.fields).values().cloned().collect();
        let mut out: Vec<Arc<FieldState>> = cells.iter().map(|c| Arc::clone(&utils::read(&c.snapshot))).collect();
        out.sort_by(|a, b| a.field_id.cmp(&b.field_id));
        out
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn cell_for(&self, id: &FieldId) -> Arc<FieldCell> {
        if let Some(cell) = utils::read(&self.inner.fields).get(id) {
            return Arc::clone(cell);
        }
        let mut fields = utils::write(&self.inner.fields);
        Arc::clone(fields.entry(id.clone()).or_insert_with(|| {
            debug!("Field {}: first event, creating state", id);
            Arc::new(FieldCell {
                merge: Mutex::new(()),
                snapshot: RwLock::new(Arc::new(FieldState::empty(id.clone()))),
            })
        }))
    }

    fn notify(&self, snapshot: &Arc<FieldState>) {
        let targets = self
            .inner
            .subscribers
            .matching(|s| s.filter.matches(&snapshot.field_id));
        for target in targets {
            if !target.active.load(Ordering::Acquire) {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (target.callback)(snapshot))) {
                error!(
                    "Store subscriber panicked on field {} revision {}: {}",
                    snapshot.field_id,
                    snapshot.revision,
                    utils::panic_reason(&*payload)
                );
            }
        }
    }
}
