//! Built-in telemetry plugins

use std::sync::Arc;

use super::contract::{TelemetryContract, TelemetryType};
use super::graph::{DataPlugin, DataProducer, DataSourceKind, DependencyGraph, ValidationError};
use crate::routing::picker::LeastQueuePicker;

/// Requests waiting in the backend's queue
pub const QUEUED_REQUESTS: &str = "queued-requests";
/// Requests the backend is currently serving
pub const RUNNING_REQUESTS: &str = "running-requests";
/// Fraction of the KV cache in use, 0.0 to 1.0
pub const KV_CACHE_UTILIZATION: &str = "kv-cache-utilization";
/// Adapters loaded on the backend
pub const LORA_INFO: &str = "lora-info";

/// Record schema of [`LORA_INFO`]: `{ "active_adapters": [..], "max_adapters": n }`
pub const LORA_INFO_SCHEMA: &str = "lora-info";

/// Per-backend serving metrics, scraped on the refresh loop
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsDataSource;

impl MetricsDataSource {
    pub const NAME: &'static str = "metrics-data-source";
}

impl DataPlugin for MetricsDataSource {
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl DataProducer for MetricsDataSource {
    fn produces(&self) -> TelemetryContract {
        TelemetryContract::new()
            .with(QUEUED_REQUESTS, TelemetryType::Integer)
            .with(RUNNING_REQUESTS, TelemetryType::Integer)
            .with(KV_CACHE_UTILIZATION, TelemetryType::Float)
            .with(LORA_INFO, TelemetryType::record(LORA_INFO_SCHEMA))
    }

    fn source_kind(&self) -> DataSourceKind {
        DataSourceKind::PoolLevel
    }
}

/// Graph of the plugins the picker ships with
pub fn default_graph() -> Result<DependencyGraph, ValidationError> {
    let producers: Vec<Arc<dyn DataProducer>> = vec![Arc::new(MetricsDataSource)];
    let consumers: Vec<Arc<dyn DataPlugin>> = vec![Arc::new(LeastQueuePicker)];
    DependencyGraph::build(&producers, &consumers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_graph_wires_picker_to_metrics() {
        let graph = default_graph().expect("built-in plugins must validate");

        let picker = graph.get(LeastQueuePicker::NAME).unwrap();
        let source = graph.get(MetricsDataSource::NAME).unwrap();
        assert_eq!(picker.upstream().get(QUEUED_REQUESTS), Some(&source.id()));
        assert!(source.is_root());
        assert_eq!(source.produces().len(), 4);
    }
}
