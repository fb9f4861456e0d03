//! In-memory collaborators for tests
//!
//! [`StaticResourceSource`] serves resources from maps the test controls,
//! and [`ScriptedTelemetryFetcher`] answers scrapes from per-address scripts.
//! Both can be told to fail.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::datalayer::TelemetrySnapshot;
use crate::datastore::{Backend, Membership, Model, Pool, ResourceId};
use crate::source::{FetchError, ResourceKind, ResourceSource, TelemetryFetcher};

// ============================================================================
// Resource Source
// ============================================================================

#[derive(Debug, Default)]
pub struct StaticResourceSource {
    pools: RwLock<HashMap<ResourceId, Pool>>,
    models: RwLock<HashMap<ResourceId, Model>>,
    memberships: RwLock<HashMap<ResourceId, Membership>>,
    /// One-shot failures, consumed by the next fetch of that resource
    failures: DashMap<(ResourceKind, ResourceId), FetchError>,
    fetches: DashMap<(ResourceKind, ResourceId), u32>,
}

impl StaticResourceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pool(&self, pool: Pool) {
        self.pools.write().insert(pool.id.clone(), pool);
    }

    pub fn remove_pool(&self, id: &ResourceId) {
        self.pools.write().remove(id);
    }

    pub fn set_model(&self, id: ResourceId, model: Model) {
        self.models.write().insert(id, model);
    }

    pub fn remove_model(&self, id: &ResourceId) {
        self.models.write().remove(id);
    }

    pub fn set_membership(&self, membership: Membership) {
        self.memberships
            .write()
            .insert(membership.id.clone(), membership);
    }

    pub fn remove_membership(&self, id: &ResourceId) {
        self.memberships.write().remove(id);
    }

    /// Make the next fetch of this resource fail
    pub fn fail_next(&self, kind: ResourceKind, id: &ResourceId, error: FetchError) {
        self.failures.insert((kind, id.clone()), error);
    }

    pub fn fetch_count(&self, kind: ResourceKind, id: &ResourceId) -> u32 {
        self.fetches
            .get(&(kind, id.clone()))
            .map(|n| *n)
            .unwrap_or(0)
    }

    fn record(&self, kind: ResourceKind, id: &ResourceId) -> Result<(), FetchError> {
        let key = (kind, id.clone());
        *self.fetches.entry(key.clone()).or_insert(0) += 1;
        match self.failures.remove(&key) {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceSource for StaticResourceSource {
    async fn fetch_pool(&self, id: &ResourceId) -> Result<Option<Pool>, FetchError> {
        self.record(ResourceKind::Pool, id)?;
        Ok(self.pools.read().get(id).cloned())
    }

    async fn fetch_model(&self, id: &ResourceId) -> Result<Option<Model>, FetchError> {
        self.record(ResourceKind::Model, id)?;
        Ok(self.models.read().get(id).cloned())
    }

    async fn fetch_membership(&self, id: &ResourceId) -> Result<Option<Membership>, FetchError> {
        self.record(ResourceKind::Membership, id)?;
        Ok(self.memberships.read().get(id).cloned())
    }
}

// ============================================================================
// Telemetry Fetcher
// ============================================================================

#[derive(Debug, Clone)]
enum Script {
    Respond(TelemetrySnapshot),
    Fail(FetchError),
}

/// Answers scrapes per backend address
///
/// Addresses without a script fail with [`FetchError::Unavailable`].
#[derive(Debug, Default)]
pub struct ScriptedTelemetryFetcher {
    scripts: DashMap<String, Script>,
    delays: DashMap<String, Duration>,
    fetches: DashMap<String, u32>,
}

impl ScriptedTelemetryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, address: &str, snapshot: TelemetrySnapshot) {
        self.scripts
            .insert(address.to_string(), Script::Respond(snapshot));
    }

    /// Fail every scrape of `address` until a snapshot is set again
    pub fn fail(&self, address: &str, error: FetchError) {
        self.scripts.insert(address.to_string(), Script::Fail(error));
    }

    /// Stall scrapes of `address` before answering
    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.delays.insert(address.to_string(), delay);
    }

    pub fn fetch_count(&self, address: &str) -> u32 {
        self.fetches.get(address).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl TelemetryFetcher for ScriptedTelemetryFetcher {
    async fn fetch(
        &self,
        backend: &Backend,
        _previous: Option<&TelemetrySnapshot>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        *self.fetches.entry(backend.address.clone()).or_insert(0) += 1;

        let delay = self.delays.get(&backend.address).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.scripts.get(&backend.address).map(|s| s.value().clone());
        match script {
            Some(Script::Respond(snapshot)) => Ok(snapshot),
            Some(Script::Fail(error)) => Err(error),
            None => Err(FetchError::Unavailable(format!(
                "no script for {}",
                backend.address
            ))),
        }
    }
}
