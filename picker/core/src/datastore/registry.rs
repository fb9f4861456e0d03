//! Keyed Registries
//!
//! Models are keyed by model name, backends by network address. Records are
//! immutable once published: writers build a new record and swap its `Arc`
//! in under the write lock, so readers always see a whole record.
//!
//! ```text
//!                       Registry<V>
//!            ┌─────────────────────────────────────┐
//!            │ BTreeMap<String, Arc<V>>            │
//!            │   - wrapped in parking_lot::RwLock  │
//!            └──────────────┬──────────────────────┘
//!                           │
//!       reconcilers ── upsert/delete       routing ── get/list
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{Backend, Model, ResourceId};
use crate::datalayer::TelemetrySnapshot;

/// Lock-guarded map of shared records
pub struct Registry<V> {
    entries: RwLock<BTreeMap<String, Arc<V>>>,
}

pub type ModelRegistry = Registry<Model>;
pub type BackendRegistry = Registry<Backend>;

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> fmt::Debug for Registry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.read().len())
            .finish()
    }
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, returning the previous one
    pub fn upsert(&self, key: impl Into<String>, record: V) -> Option<Arc<V>> {
        let record = Arc::new(record);
        self.entries.write().insert(key.into(), record)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Remove a record; deleting a missing key is a no-op
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Snapshot of every record, ordered by key
    #[must_use]
    pub fn list(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replace an existing record with one derived from it
    ///
    /// Returns `false` without calling `update` if the key is absent.
    pub fn update<F>(&self, key: &str, update: F) -> bool
    where
        F: FnOnce(&V) -> V,
    {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(slot) => {
                let next = update(slot);
                *slot = Arc::new(next);
                true
            }
            None => false,
        }
    }

    /// Drop every record the predicate rejects, returning the removed ones
    pub fn retain<F>(&self, mut keep: F) -> Vec<Arc<V>>
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, record)| !keep(key, record))
            .map(|(key, _)| key.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|key| entries.remove(key))
            .collect()
    }
}

impl Registry<Backend> {
    /// Attach a fresh snapshot to a still-registered backend
    ///
    /// A backend removed while its scrape was in flight stays removed.
    pub fn update_telemetry(&self, address: &str, snapshot: TelemetrySnapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        self.update(address, |backend| Backend {
            telemetry: Some(snapshot),
            ..backend.clone()
        })
    }

    /// Remove backends contributed by `source` that are not in `keep`
    pub fn retain_source(&self, source: &ResourceId, keep: &HashSet<String>) -> Vec<Arc<Backend>> {
        self.retain(|address, backend| backend.source != *source || keep.contains(address))
    }

    pub fn with_telemetry_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|b| b.has_telemetry())
            .count()
    }
}
