//! Membership reconciler

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::reconciler::{Reconciler, SyncError};
use crate::datastore::{Backend, Datastore, ResourceId};
use crate::source::{ResourceKind, ResourceSource};

/// Keeps the backend registry in line with the pool's membership resource
///
/// Only the configured membership is synced; notifications for any other
/// identity are ignored. Ready endpoints whose labels satisfy the pool
/// selector become backends, so a membership cannot be applied before the
/// pool itself has synced. Telemetry already collected for an address
/// survives a re-sync. Backends the membership contributed earlier and no
/// longer lists (or no longer selects) are removed, as is everything it
/// contributed once the membership itself disappears.
pub struct MembershipReconciler {
    datastore: Arc<Datastore>,
    source: Arc<dyn ResourceSource>,
    membership_id: ResourceId,
}

impl MembershipReconciler {
    pub fn new(
        datastore: Arc<Datastore>,
        source: Arc<dyn ResourceSource>,
        membership_id: ResourceId,
    ) -> Self {
        Self {
            datastore,
            source,
            membership_id,
        }
    }
}

#[async_trait]
impl Reconciler for MembershipReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Membership
    }

    async fn sync(&self, id: &ResourceId) -> Result<(), SyncError> {
        if *id != self.membership_id {
            tracing::trace!(id = %id, "Ignoring membership outside the served pool");
            return Ok(());
        }

        let fetched = self
            .source
            .fetch_membership(id)
            .await
            .map_err(|e| SyncError::fetch(ResourceKind::Membership, id, e))?;

        let backends = self.datastore.backends();
        let mut listed = HashSet::new();
        let mut added = 0usize;
        let mut unselected = 0usize;

        if let Some(membership) = fetched {
            let pool = self
                .datastore
                .pool()
                .get()
                .map_err(|_| SyncError::PoolNotSynced {
                    kind: ResourceKind::Membership,
                    id: id.clone(),
                })?;

            for endpoint in membership.ready_endpoints() {
                if !pool.selects(&endpoint.labels) {
                    unselected += 1;
                    continue;
                }
                listed.insert(endpoint.address.clone());

                let existing = backends.get(&endpoint.address);
                let unchanged = existing
                    .as_ref()
                    .is_some_and(|b| b.name == endpoint.name && b.source == *id);
                if unchanged {
                    continue;
                }

                let backend = Backend {
                    address: endpoint.address.clone(),
                    name: endpoint.name.clone(),
                    source: id.clone(),
                    telemetry: existing.and_then(|b| b.telemetry.clone()),
                };
                backends.upsert(endpoint.address.clone(), backend);
                added += 1;
            }
        }

        let removed = backends.retain_source(id, &listed);
        if added > 0 || !removed.is_empty() {
            tracing::info!(
                id = %id,
                added,
                removed = removed.len(),
                unselected,
                total = backends.len(),
                "Membership synced"
            );
        }
        Ok(())
    }
}
