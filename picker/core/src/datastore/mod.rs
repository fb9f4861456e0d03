//! Datastore
//!
//! The only mutable shared state in the picker: the live pool, the model
//! registry, and the backend registry. Reconcilers and the telemetry loop
//! write; the routing path reads.

pub mod pool;
pub mod registry;
pub mod types;

use serde::Serialize;

pub use pool::{PoolStore, StoreError};
pub use registry::{BackendRegistry, ModelRegistry, Registry};
pub use types::{Backend, Criticality, Endpoint, Membership, Model, Pool, ResourceId, TargetModel};

/// Shared picker state, passed around as `Arc<Datastore>`
#[derive(Debug, Default)]
pub struct Datastore {
    pool: PoolStore,
    models: ModelRegistry,
    backends: BackendRegistry,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self) -> &PoolStore {
        &self.pool
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Counts for readiness probes
    ///
    /// Each store is read under its own lock, one after the other, so the
    /// counts may come from slightly different moments.
    pub fn readiness(&self) -> Readiness {
        Readiness {
            pool_ready: self.pool.is_ready(),
            models: self.models.len(),
            backends: self.backends.len(),
            backends_with_telemetry: self.backends.with_telemetry_count(),
        }
    }
}

/// Readiness probe result
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub pool_ready: bool,
    pub models: usize,
    pub backends: usize,
    pub backends_with_telemetry: usize,
}

impl Readiness {
    /// Ready to answer queries at all
    pub fn is_ready(&self) -> bool {
        self.pool_ready
    }

    /// Has everything a successful route needs
    pub fn is_routable(&self) -> bool {
        self.pool_ready && self.models > 0 && self.backends > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_tracks_stores() {
        let datastore = Datastore::new();
        assert_eq!(datastore.readiness(), Readiness::default());
        assert!(!datastore.readiness().is_ready());

        datastore
            .pool()
            .replace(Pool::new(ResourceId::new("default", "pool"), 8000));
        datastore.models().upsert("m", Model::new("m", "pool"));
        let readiness = datastore.readiness();
        assert!(readiness.is_ready());
        assert!(!readiness.is_routable());

        datastore.backends().upsert(
            "10.0.0.1",
            Backend::new("10.0.0.1", "a", ResourceId::new("default", "svc")),
        );
        let readiness = datastore.readiness();
        assert!(readiness.is_routable());
        assert_eq!(readiness.backends_with_telemetry, 0);
    }
}
