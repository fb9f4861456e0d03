//! Pool reconciler

use std::sync::Arc;

use async_trait::async_trait;

use super::queue::WorkQueue;
use super::reconciler::{Reconciler, SyncError};
use crate::datastore::{Datastore, ResourceId};
use crate::source::{ResourceKind, ResourceSource};

/// Keeps the [`PoolStore`](crate::datastore::PoolStore) in line with the
/// configured pool resource
///
/// Notifications for any other pool are ignored. A pool that disappears
/// upstream keeps its last synced value. Resources filtered by the pool
/// selector are re-queued whenever the selector changes.
pub struct PoolReconciler {
    datastore: Arc<Datastore>,
    source: Arc<dyn ResourceSource>,
    pool_id: ResourceId,
    dependents: Vec<(Arc<WorkQueue<ResourceId>>, ResourceId)>,
}

impl PoolReconciler {
    pub fn new(
        datastore: Arc<Datastore>,
        source: Arc<dyn ResourceSource>,
        pool_id: ResourceId,
    ) -> Self {
        Self {
            datastore,
            source,
            pool_id,
            dependents: Vec::new(),
        }
    }

    /// Re-queue `id` on `queue` when the pool selector changes
    #[must_use]
    pub fn with_dependent(mut self, queue: Arc<WorkQueue<ResourceId>>, id: ResourceId) -> Self {
        self.dependents.push((queue, id));
        self
    }
}

#[async_trait]
impl Reconciler for PoolReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pool
    }

    async fn sync(&self, id: &ResourceId) -> Result<(), SyncError> {
        if *id != self.pool_id {
            tracing::trace!(id = %id, "Ignoring pool this picker does not serve");
            return Ok(());
        }

        let fetched = self
            .source
            .fetch_pool(id)
            .await
            .map_err(|e| SyncError::fetch(ResourceKind::Pool, id, e))?;

        let Some(pool) = fetched else {
            tracing::warn!(id = %id, "Pool not found, keeping last synced configuration");
            return Ok(());
        };

        let store = self.datastore.pool();
        let current = store.get().ok();
        if current.as_deref() == Some(&pool) {
            return Ok(());
        }
        let selector_changed = current.map_or(true, |c| c.selector != pool.selector);

        let target_port = pool.target_port;
        let previous = store.replace(pool);
        tracing::info!(
            id = %id,
            target_port,
            first_sync = previous.is_none(),
            selector_changed,
            "Pool synced"
        );

        if selector_changed {
            for (queue, dependent) in &self.dependents {
                queue.add(dependent.clone());
            }
        }
        Ok(())
    }
}
