//! Change notification dispatch

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::queue::WorkQueue;
use crate::datastore::ResourceId;
use crate::source::{ChangeEvent, ResourceKind};

/// Routes change notifications to the work queue of the matching loop
#[derive(Clone)]
pub struct ChangeDispatcher {
    pools: Arc<WorkQueue<ResourceId>>,
    models: Arc<WorkQueue<ResourceId>>,
    memberships: Arc<WorkQueue<ResourceId>>,
}

impl ChangeDispatcher {
    pub fn new(
        pools: Arc<WorkQueue<ResourceId>>,
        models: Arc<WorkQueue<ResourceId>>,
        memberships: Arc<WorkQueue<ResourceId>>,
    ) -> Self {
        Self {
            pools,
            models,
            memberships,
        }
    }

    pub fn dispatch(&self, event: ChangeEvent) {
        tracing::trace!(kind = %event.kind, id = %event.id, "Change notification");
        let queue = match event.kind {
            ResourceKind::Pool => &self.pools,
            ResourceKind::Model => &self.models,
            ResourceKind::Membership => &self.memberships,
        };
        queue.add(event.id);
    }

    /// Forward events until shutdown or until every sender is gone
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        tracing::info!("Change notification channel closed");
                        break;
                    }
                },
            }
        }
    }
}
