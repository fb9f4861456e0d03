//! Routing Query Surface
//!
//! ```text
//!   route("llama")
//!        │
//!        ├── pool synced?            no ──> NotReady
//!        ├── model registered?       no ──> UnknownModel
//!        ├── weighted variant draw   0  ──> NoRoutableVariant
//!        └── backend picker          ∅  ──> NoAvailableBackend
//!                 │
//!                 ▼
//!        RoutingDecision { variant, address, port, priority }
//! ```
//!
//! Every lookup reads the datastore once per store, so a decision never
//! mixes two versions of the same record. Inconsistent combinations (for
//! example a model whose pool is not the synced pool) fail closed.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::picker::{BackendPicker, LeastQueuePicker};
use super::selection::{classify_criticality, select_variant, RequestPriority};
use crate::datalayer::{DependencyGraph, ValidationError};
use crate::datastore::Datastore;
use crate::metrics::RouterMetrics;

/// Why a request could not be routed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("endpoint picker is not ready: pool has not been synced")]
    NotReady,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {0} has no variant with positive weight")]
    NoRoutableVariant(String),

    #[error("no available backend for model {0}")]
    NoAvailableBackend(String),
}

/// Where to send one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    /// Model name as requested
    pub model: String,
    /// Variant the request should be rewritten to
    pub variant: String,
    pub address: String,
    pub port: u16,
    pub priority: RequestPriority,
}

impl RoutingDecision {
    /// `address:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} @ {}", self.model, self.variant, self.target())
    }
}

/// Read-only routing entry point shared by request handlers
#[derive(Clone)]
pub struct RoutingQuery {
    datastore: Arc<Datastore>,
    picker: Arc<dyn BackendPicker>,
    metrics: Arc<RouterMetrics>,
}

impl RoutingQuery {
    /// Route with the built-in [`LeastQueuePicker`]
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self::from_parts(datastore, Arc::new(LeastQueuePicker))
    }

    /// Route with `picker`, which must be a consumer in `graph` whose reads
    /// are all wired to producers
    pub fn with_picker(
        datastore: Arc<Datastore>,
        picker: Arc<dyn BackendPicker>,
        graph: &DependencyGraph,
    ) -> Result<Self, ValidationError> {
        let node = graph.admit(picker.as_ref())?;
        debug!(picker = node.name(), upstream = node.upstream().len(), "Picker admitted");
        Ok(Self::from_parts(datastore, picker))
    }

    fn from_parts(datastore: Arc<Datastore>, picker: Arc<dyn BackendPicker>) -> Self {
        Self {
            datastore,
            picker,
            metrics: Arc::new(RouterMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn route(&self, model: &str) -> Result<RoutingDecision, RoutingError> {
        self.observe(model, None)
    }

    /// Route with a reproducible variant draw
    pub fn route_with_seed(&self, model: &str, seed: u64) -> Result<RoutingDecision, RoutingError> {
        self.observe(model, Some(seed))
    }

    fn observe(&self, model: &str, seed: Option<u64>) -> Result<RoutingDecision, RoutingError> {
        let start = Instant::now();
        let result = self.decide(model, seed);
        self.metrics.decision_time.record_duration(start.elapsed());

        match &result {
            Ok(decision) => {
                self.metrics.routed.inc();
                self.metrics.record_variant(&decision.variant);
                debug!(
                    model = %decision.model,
                    variant = %decision.variant,
                    target = %decision.target(),
                    priority = ?decision.priority,
                    "Routed request"
                );
            }
            Err(e) => {
                match e {
                    RoutingError::NotReady => self.metrics.not_ready.inc(),
                    RoutingError::UnknownModel(_) => self.metrics.unknown_model.inc(),
                    RoutingError::NoRoutableVariant(_) => self.metrics.no_routable_variant.inc(),
                    RoutingError::NoAvailableBackend(_) => {
                        self.metrics.no_available_backend.inc()
                    }
                }
                debug!(model, error = %e, "Routing failed");
            }
        }
        result
    }

    fn decide(&self, name: &str, seed: Option<u64>) -> Result<RoutingDecision, RoutingError> {
        let pool = self
            .datastore
            .pool()
            .get()
            .map_err(|_| RoutingError::NotReady)?;

        let model = self
            .datastore
            .models()
            .get(name)
            .filter(|m| m.pool == pool.id.name)
            .ok_or_else(|| RoutingError::UnknownModel(name.to_string()))?;

        let variant = if model.targets.is_empty() {
            model.name.clone()
        } else {
            select_variant(&model, seed)?.to_string()
        };

        let backends = self.datastore.backends().list();
        let backend = self
            .picker
            .pick(&backends)
            .ok_or_else(|| RoutingError::NoAvailableBackend(name.to_string()))?;

        Ok(RoutingDecision {
            model: model.name.clone(),
            variant,
            address: backend.address.clone(),
            port: pool.target_port,
            priority: classify_criticality(&model),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalayer::plugins::KV_CACHE_UTILIZATION;
    use crate::datalayer::{
        default_graph, DataPlugin, DataProducer, MetricsDataSource, TelemetryContract,
        TelemetrySnapshot, TelemetryType, TelemetryValue,
    };
    use crate::datastore::{Backend, Criticality, Model, Pool, ResourceId};

    fn ready_datastore() -> Arc<Datastore> {
        let datastore = Arc::new(Datastore::new());
        datastore
            .pool()
            .replace(Pool::new(ResourceId::new("default", "pool"), 8000));
        datastore.backends().upsert(
            "10.0.0.1",
            Backend::new("10.0.0.1", "a", ResourceId::new("default", "svc")),
        );
        datastore
    }

    #[test]
    fn test_not_ready_before_pool_sync() {
        let query = RoutingQuery::new(Arc::new(Datastore::new()));
        assert_eq!(query.route("m").unwrap_err(), RoutingError::NotReady);
        assert_eq!(query.metrics().not_ready.get(), 1);
    }

    #[test]
    fn test_unknown_model() {
        let query = RoutingQuery::new(ready_datastore());
        assert_eq!(
            query.route("missing").unwrap_err(),
            RoutingError::UnknownModel("missing".into())
        );
    }

    #[test]
    fn test_model_of_other_pool_fails_closed() {
        let datastore = ready_datastore();
        datastore
            .models()
            .upsert("m", Model::new("m", "other-pool").with_target("v1", 1));
        let query = RoutingQuery::new(datastore);
        assert!(matches!(query.route("m"), Err(RoutingError::UnknownModel(_))));
    }

    #[test]
    fn test_routes_to_backend() {
        let datastore = ready_datastore();
        datastore.models().upsert(
            "m",
            Model::new("m", "pool")
                .with_target("v1", 1)
                .with_criticality(Criticality::Critical),
        );
        let query = RoutingQuery::new(datastore);

        let decision = query.route_with_seed("m", 7).unwrap();
        assert_eq!(decision.variant, "v1");
        assert_eq!(decision.target(), "10.0.0.1:8000");
        assert_eq!(decision.priority, RequestPriority::Critical);
        assert_eq!(query.metrics().variant_count("v1"), 1);
    }

    #[test]
    fn test_model_without_variants_uses_own_name() {
        let datastore = ready_datastore();
        datastore.models().upsert("base", Model::new("base", "pool"));
        let query = RoutingQuery::new(datastore);
        assert_eq!(query.route("base").unwrap().variant, "base");
    }

    #[test]
    fn test_zero_weight_model() {
        let datastore = ready_datastore();
        datastore
            .models()
            .upsert("m", Model::new("m", "pool").with_target("v1", 0));
        let query = RoutingQuery::new(datastore);
        assert_eq!(
            query.route("m").unwrap_err(),
            RoutingError::NoRoutableVariant("m".into())
        );
    }

    /// Prefers the backend with the emptiest KV cache
    struct KvPicker;

    impl DataPlugin for KvPicker {
        fn name(&self) -> &str {
            "kv-picker"
        }

        fn consumes(&self) -> TelemetryContract {
            TelemetryContract::new().with(KV_CACHE_UTILIZATION, TelemetryType::Float)
        }
    }

    impl BackendPicker for KvPicker {
        fn pick(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
            backends
                .iter()
                .filter_map(|b| {
                    let kv = b.telemetry.as_ref()?.float(KV_CACHE_UTILIZATION)?;
                    Some((kv, b))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, b)| Arc::clone(b))
        }
    }

    #[test]
    fn test_custom_picker_is_admitted_through_graph() {
        let producers: Vec<Arc<dyn DataProducer>> = vec![Arc::new(MetricsDataSource)];
        let consumers: Vec<Arc<dyn DataPlugin>> = vec![Arc::new(KvPicker)];
        let graph = DependencyGraph::build(&producers, &consumers).unwrap();

        let datastore = ready_datastore();
        datastore.backends().upsert(
            "10.0.0.2",
            Backend::new("10.0.0.2", "b", ResourceId::new("default", "svc")).with_telemetry(
                TelemetrySnapshot::new().with(KV_CACHE_UTILIZATION, TelemetryValue::float(0.1)),
            ),
        );
        datastore.models().upsert("m", Model::new("m", "pool"));

        let query = RoutingQuery::with_picker(datastore, Arc::new(KvPicker), &graph).unwrap();
        assert_eq!(query.route("m").unwrap().address, "10.0.0.2");
    }

    #[test]
    fn test_picker_outside_graph_is_rejected() {
        let graph = default_graph().unwrap();
        let result = RoutingQuery::with_picker(ready_datastore(), Arc::new(KvPicker), &graph);
        assert!(matches!(
            result,
            Err(ValidationError::UnregisteredPlugin(name)) if name == "kv-picker"
        ));

        assert!(
            RoutingQuery::with_picker(ready_datastore(), Arc::new(LeastQueuePicker), &graph)
                .is_ok()
        );
    }

    #[test]
    fn test_no_backends() {
        let datastore = Arc::new(Datastore::new());
        datastore
            .pool()
            .replace(Pool::new(ResourceId::new("default", "pool"), 8000));
        datastore
            .models()
            .upsert("m", Model::new("m", "pool").with_target("v1", 1));
        let query = RoutingQuery::new(datastore);
        assert_eq!(
            query.route("m").unwrap_err(),
            RoutingError::NoAvailableBackend("m".into())
        );
    }
}
