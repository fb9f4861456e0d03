//! Reconcile Loop
//!
//! Drives one [`Reconciler`] from a [`WorkQueue`] with a fixed pool of
//! workers. Each worker repeatedly takes an identity, calls `sync`, and
//! either forgets the identity's failure history or re-enqueues it through
//! the rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::queue::WorkQueue;
use super::rate_limit::default_rate_limiter;
use crate::config::ReconcileConfig;
use crate::datastore::ResourceId;
use crate::metrics::Counter;
use crate::source::{FetchError, ResourceKind};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {kind} {id} failed: {source}")]
    Fetch {
        kind: ResourceKind,
        id: ResourceId,
        #[source]
        source: FetchError,
    },

    #[error("{kind} {id} depends on the pool, which has not been synced")]
    PoolNotSynced { kind: ResourceKind, id: ResourceId },
}

impl SyncError {
    pub fn fetch(kind: ResourceKind, id: &ResourceId, source: FetchError) -> Self {
        Self::Fetch {
            kind,
            id: id.clone(),
            source,
        }
    }
}

/// Brings the datastore in line with one resource's current state
///
/// `sync` must be idempotent: it can run any number of times for the same
/// identity.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn kind(&self) -> ResourceKind;

    async fn sync(&self, id: &ResourceId) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    pub synced: Counter,
    pub failed: Counter,
    pub requeued: Counter,
}

pub struct ReconcileLoop<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ResourceId>>,
    workers: usize,
    failure_log_threshold: u32,
    metrics: Arc<ReconcileMetrics>,
}

impl<R> Clone for ReconcileLoop<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            workers: self.workers,
            failure_log_threshold: self.failure_log_threshold,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<R: Reconciler> ReconcileLoop<R> {
    pub fn new(reconciler: R, config: &ReconcileConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new(default_rate_limiter(config))),
            workers: config.workers.max(1),
            failure_log_threshold: config.failure_log_threshold,
            metrics: Arc::new(ReconcileMetrics::default()),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ResourceId>> {
        Arc::clone(&self.queue)
    }

    pub fn metrics(&self) -> Arc<ReconcileMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    pub fn enqueue(&self, id: ResourceId) {
        self.queue.add(id);
    }

    /// Run the workers until `shutdown` flips to true (or its sender drops)
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.reconciler.kind();
        tracing::info!(kind = %kind, workers = self.workers, "Starting reconcile loop");

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let worker = self.clone();
            workers.spawn(async move { while worker.process_next_item().await {} });
        }

        let _ = shutdown.wait_for(|stop| *stop).await;

        tracing::info!(kind = %kind, "Stopping reconcile loop");
        self.queue.shut_down();
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }

    /// Handle one queued identity; `false` once the queue has shut down
    pub async fn process_next_item(&self) -> bool {
        let Some(id) = self.queue.get().await else {
            return false;
        };
        let kind = self.reconciler.kind();

        match self.reconciler.sync(&id).await {
            Ok(()) => {
                self.queue.forget(&id);
                self.metrics.synced.inc();
                tracing::debug!(kind = %kind, id = %id, "Synced");
            }
            Err(e) => {
                self.metrics.failed.inc();
                let retries = self.queue.retries(&id);
                if retries >= self.failure_log_threshold {
                    tracing::warn!(kind = %kind, id = %id, retries, error = %e, "Sync keeps failing, requeuing");
                } else {
                    tracing::debug!(kind = %kind, id = %id, retries, error = %e, "Sync failed, requeuing");
                }
                self.queue.add_rate_limited(id.clone());
                self.metrics.requeued.inc();
            }
        }

        self.queue.done(&id);
        true
    }
}
