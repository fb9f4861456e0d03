//! Datastore record types

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::datalayer::TelemetrySnapshot;

fn default_namespace() -> String {
    "default".to_string()
}

/// Identity of an externally managed resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Backend selection criteria and serving port
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(flatten)]
    pub id: ResourceId,
    /// Labels a backend must carry to belong to the pool
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub target_port: u16,
}

impl Pool {
    pub fn new(id: ResourceId, target_port: u16) -> Self {
        Self {
            id,
            selector: BTreeMap::new(),
            target_port,
        }
    }

    #[must_use]
    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }

    /// Whether `labels` carry every selector entry; an empty selector
    /// selects everything
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

// ============================================================================
// Model
// ============================================================================

/// How important a model's traffic is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Criticality {
    Critical,
    Standard,
    Sheddable,
    /// Any value this build does not recognise
    #[serde(other)]
    Unknown,
}

/// A weighted variant a model request can be served by
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetModel {
    pub name: String,
    #[serde(default)]
    pub weight: u32,
}

/// A servable model and its variants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Name of the pool serving this model
    pub pool: String,
    #[serde(default)]
    pub criticality: Option<Criticality>,
    #[serde(default)]
    pub targets: Vec<TargetModel>,
}

impl Model {
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            criticality: None,
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.targets.push(TargetModel {
            name: name.into(),
            weight,
        });
        self
    }

    #[must_use]
    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = Some(criticality);
        self
    }

    /// Sum of variant weights; cannot overflow
    pub fn total_weight(&self) -> u64 {
        self.targets.iter().map(|t| u64::from(t.weight)).sum()
    }
}

// ============================================================================
// Backend
// ============================================================================

/// A serving endpoint in the pool
#[derive(Clone, Debug, PartialEq)]
pub struct Backend {
    /// Network address, unique across the registry
    pub address: String,
    pub name: String,
    /// Membership resource that contributed this backend
    pub source: ResourceId,
    /// Latest scrape; `None` until the first successful refresh
    pub telemetry: Option<Arc<TelemetrySnapshot>>,
}

impl Backend {
    pub fn new(address: impl Into<String>, name: impl Into<String>, source: ResourceId) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            source,
            telemetry: None,
        }
    }

    #[must_use]
    pub fn with_telemetry(mut self, snapshot: TelemetrySnapshot) -> Self {
        self.telemetry = Some(Arc::new(snapshot));
        self
    }

    pub fn has_telemetry(&self) -> bool {
        self.telemetry.is_some()
    }
}

// ============================================================================
// Membership
// ============================================================================

fn default_ready() -> bool {
    true
}

/// One endpoint listed by a membership resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_ready")]
    pub ready: bool,
    /// Labels of the workload behind the endpoint, matched against the
    /// pool selector
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn ready(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            ready: true,
            labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn not_ready(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ready: false,
            ..Self::ready(address, name)
        }
    }
}

/// Endpoints currently backing a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    #[serde(flatten)]
    pub id: ResourceId,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Membership {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            endpoints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn ready_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.ready)
    }
}
