//! Telemetry data layer
//!
//! Contracts between telemetry producers and consumers, and the dependency
//! graph assembled from them at startup.

pub mod contract;
pub mod graph;
pub mod plugins;

pub use contract::{TelemetryContract, TelemetrySnapshot, TelemetryType, TelemetryValue};
pub use graph::{
    build, DataPlugin, DataProducer, DataSourceKind, DependencyGraph, NodeId, PluginHandle,
    PluginNode, ValidationError,
};
pub use plugins::{default_graph, MetricsDataSource};
