//! Collaborator interfaces
//!
//! The picker never talks to the control plane or to backends directly.
//! Resource state comes through a [`ResourceSource`], telemetry through a
//! [`TelemetryFetcher`], and change notifications as [`ChangeEvent`]s on a
//! channel.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datalayer::TelemetrySnapshot;
use crate::datastore::{Backend, Membership, Model, Pool, ResourceId};

/// Which reconcile loop a resource belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pool,
    Model,
    Membership,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => write!(f, "pool"),
            Self::Model => write!(f, "model"),
            Self::Membership => write!(f, "membership"),
        }
    }
}

/// "Something about this resource may have changed"
///
/// Carries no payload: the reconciler always re-reads current state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub id: ResourceId,
}

impl ChangeEvent {
    pub fn new(kind: ResourceKind, id: ResourceId) -> Self {
        Self { kind, id }
    }

    pub fn pool(id: ResourceId) -> Self {
        Self::new(ResourceKind::Pool, id)
    }

    pub fn model(id: ResourceId) -> Self {
        Self::new(ResourceKind::Model, id)
    }

    pub fn membership(id: ResourceId) -> Self {
        Self::new(ResourceKind::Membership, id)
    }
}

/// Upstream fetch failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Authoritative resource state
///
/// `Ok(None)` means the resource does not exist, which is not an error.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn fetch_pool(&self, id: &ResourceId) -> Result<Option<Pool>, FetchError>;

    async fn fetch_model(&self, id: &ResourceId) -> Result<Option<Model>, FetchError>;

    async fn fetch_membership(&self, id: &ResourceId) -> Result<Option<Membership>, FetchError>;
}

/// Scrapes one backend's telemetry
#[async_trait]
pub trait TelemetryFetcher: Send + Sync {
    /// `previous` is the backend's last good snapshot, if any
    async fn fetch(
        &self,
        backend: &Backend,
        previous: Option<&TelemetrySnapshot>,
    ) -> Result<TelemetrySnapshot, FetchError>;
}
