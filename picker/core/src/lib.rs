//! Picker Core - Decision core of an inference endpoint picker
//!
//! Keeps a concurrently readable view of one serving pool (its routing
//! configuration, the models it serves, and its backends with their latest
//! telemetry) and answers, per request, which backend and which model
//! variant should serve it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     External collaborators                       │
//! │   ResourceSource        ChangeEvent channel      TelemetryFetcher│
//! └────────┬───────────────────────┬───────────────────────┬─────────┘
//!          │                       │                       │
//! ┌────────┼───────────────────────┼───────────────────────┼─────────┐
//! │        │              ChangeDispatcher                 │         │
//! │        │          ┌────────────┼────────────┐          │         │
//! │  ┌─────▼─────┐ ┌──▼────────┐ ┌─▼──────────┐ ┌─▼────────▼───────┐ │
//! │  │   Pool    │ │   Model   │ │ Membership │ │ TelemetryRefresher│ │
//! │  │ reconcile │ │ reconcile │ │ reconcile  │ │   (interval)     │ │
//! │  └─────┬─────┘ └─────┬─────┘ └─────┬──────┘ └────────┬─────────┘ │
//! │        └─────────────┴──────┬──────┴─────────────────┘           │
//! │                      ┌──────▼──────┐                             │
//! │                      │  Datastore  │ PoolStore / Models / Backends│
//! │                      └──────┬──────┘                             │
//! │                      ┌──────▼──────┐                             │
//! │                      │RoutingQuery │ ──> RoutingDecision         │
//! │                      └─────────────┘                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`datalayer`]: telemetry contracts and the plugin dependency graph
//! - [`datastore`]: pool store and the model and backend registries
//! - [`routing`]: variant selection, backend picking, the query surface
//! - [`reconcile`]: work queue, rate limiting, and the three reconcilers
//! - [`refresh`]: periodic telemetry refresh
//! - [`source`]: collaborator traits and change events
//! - [`config`]: TOML configuration
//! - [`testing`]: in-memory collaborators

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod datalayer;
pub mod datastore;
pub mod metrics;
pub mod reconcile;
pub mod refresh;
pub mod routing;
pub mod source;
pub mod testing;

// Data layer exports
pub use datalayer::{
    DataPlugin, DataProducer, DataSourceKind, DependencyGraph, TelemetryContract,
    TelemetrySnapshot, TelemetryType, TelemetryValue, ValidationError,
};

// Datastore exports
pub use datastore::{
    Backend, Criticality, Datastore, Endpoint, Membership, Model, Pool, Readiness, ResourceId,
    StoreError, TargetModel,
};

// Routing exports
pub use routing::{
    classify_criticality, select_variant, BackendPicker, LeastQueuePicker, RequestPriority,
    RoutingDecision, RoutingError, RoutingQuery,
};

// Reconcile exports
pub use reconcile::{
    ChangeDispatcher, MembershipReconciler, ModelReconciler, PoolReconciler, ReconcileLoop,
    Reconciler, SyncError,
};

pub use refresh::{RefreshReport, RefreshStats, TelemetryRefresher};
pub use source::{ChangeEvent, FetchError, ResourceKind, ResourceSource, TelemetryFetcher};

// Config exports
pub use config::{
    default_config_path, ConfigError, ConfigOverrides, ConfigSource, PickerConfig,
    ReconcileConfig, RefreshConfig, TelemetryConfig,
};
