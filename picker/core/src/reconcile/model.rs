//! Model reconciler

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::reconciler::{Reconciler, SyncError};
use crate::datastore::{Datastore, Model, ResourceId};
use crate::source::{ResourceKind, ResourceSource};

/// Which resources declare which model names
#[derive(Debug, Default)]
struct Claims {
    by_resource: HashMap<ResourceId, String>,
    /// Ordered by resource identity; the first claimant owns the name
    by_name: HashMap<String, BTreeMap<ResourceId, Model>>,
}

impl Claims {
    fn release(&mut self, id: &ResourceId) -> Option<String> {
        let name = self.by_resource.remove(id)?;
        if let Some(claimants) = self.by_name.get_mut(&name) {
            claimants.remove(id);
            if claimants.is_empty() {
                self.by_name.remove(&name);
            }
        }
        Some(name)
    }

    fn claim(&mut self, id: &ResourceId, model: Model) {
        self.by_resource.insert(id.clone(), model.name.clone());
        self.by_name
            .entry(model.name.clone())
            .or_default()
            .insert(id.clone(), model);
    }

    fn owner(&self, name: &str) -> Option<(&ResourceId, &Model)> {
        self.by_name.get(name).and_then(|c| c.first_key_value())
    }
}

/// Keeps the model registry in line with model resources
///
/// Only models referencing the served pool are registered. The registry is
/// keyed by model name, which need not match the resource name. When
/// several resources declare the same name, the one with the lowest
/// identity is served and the others wait; deleting the owner hands the
/// name to the next claimant instead of dropping it.
pub struct ModelReconciler {
    datastore: Arc<Datastore>,
    source: Arc<dyn ResourceSource>,
    pool_name: String,
    claims: Mutex<Claims>,
}

impl ModelReconciler {
    pub fn new(
        datastore: Arc<Datastore>,
        source: Arc<dyn ResourceSource>,
        pool_name: impl Into<String>,
    ) -> Self {
        Self {
            datastore,
            source,
            pool_name: pool_name.into(),
            claims: Mutex::new(Claims::default()),
        }
    }

    /// Write the current owner of `name` to the registry, or remove it
    fn publish(&self, claims: &Claims, name: &str) {
        let models = self.datastore.models();
        match claims.owner(name) {
            Some((owner, model)) => {
                if models.get(name).is_some_and(|current| *current == *model) {
                    return;
                }
                models.upsert(name, model.clone());
                tracing::info!(
                    id = %owner,
                    model = %name,
                    variants = model.targets.len(),
                    "Model synced"
                );
            }
            None => {
                if models.delete(name) {
                    tracing::info!(model = %name, "Model removed");
                }
            }
        }
    }
}

#[async_trait]
impl Reconciler for ModelReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Model
    }

    async fn sync(&self, id: &ResourceId) -> Result<(), SyncError> {
        let fetched = self
            .source
            .fetch_model(id)
            .await
            .map_err(|e| SyncError::fetch(ResourceKind::Model, id, e))?;

        let wanted = match fetched {
            Some(model) if model.pool == self.pool_name => Some(model),
            Some(model) => {
                tracing::debug!(
                    id = %id,
                    pool = %model.pool,
                    "Model references another pool, not registering"
                );
                None
            }
            None => None,
        };

        let mut claims = self.claims.lock();
        if let Some(released) = claims.release(id) {
            if wanted.as_ref().map_or(true, |m| m.name != released) {
                self.publish(&claims, &released);
            }
        }

        let Some(model) = wanted else {
            return Ok(());
        };
        let name = model.name.clone();
        claims.claim(id, model);
        self.publish(&claims, &name);

        if let Some((owner, _)) = claims.owner(&name).filter(|(owner, _)| *owner != id) {
            tracing::warn!(
                id = %id,
                model = %name,
                owner = %owner,
                "Model name already declared by another resource, not serving this one"
            );
        }
        Ok(())
    }
}
