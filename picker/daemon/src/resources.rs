//! File-backed resource source
//!
//! Pools, models and memberships are declared in one TOML file:
//!
//! ```toml
//! [[pools]]
//! name = "vllm-pool"
//! target_port = 8000
//! selector = { app = "vllm" }
//!
//! [[models]]
//! name = "llama"
//! pool = "vllm-pool"
//! criticality = "Critical"
//! targets = [{ name = "llama-v1", weight = 90 }, { name = "llama-v2", weight = 10 }]
//!
//! [[memberships]]
//! name = "vllm-endpoints"
//! endpoints = [{ address = "10.0.0.7", name = "pod-7", labels = { app = "vllm" } }]
//! ```
//!
//! A model entry may set `resource` when its resource name differs from the
//! model name. The file is re-read on reload; every identity present before
//! or after the reload is reported so the reconcilers resync it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use picker_core::{ChangeEvent, FetchError, Membership, Model, Pool, ResourceId, ResourceSource};

#[derive(Debug, Error)]
pub enum ResourceFileError {
    #[error("failed to read resources file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse resources file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate {kind} resource {id}")]
    Duplicate { kind: &'static str, id: ResourceId },
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelEntry {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Resource name; defaults to the model name
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(flatten)]
    pub model: Model,
}

impl ModelEntry {
    pub fn id(&self) -> ResourceId {
        let name = self.resource.as_deref().unwrap_or(&self.model.name);
        ResourceId::new(&self.namespace, name)
    }
}

/// Parsed contents of a resources file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResourceFile {
    pub pools: Vec<Pool>,
    pub models: Vec<ModelEntry>,
    pub memberships: Vec<Membership>,
}

impl ResourceFile {
    pub fn from_toml_str(content: &str) -> Result<Self, ResourceFileError> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load(path: &Path) -> Result<Self, ResourceFileError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ResourceFileError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        Self::from_toml_str(&content)
    }

    fn index(self) -> Result<Resources, ResourceFileError> {
        let mut resources = Resources::default();
        for pool in self.pools {
            let id = pool.id.clone();
            if resources.pools.insert(id.clone(), pool).is_some() {
                return Err(ResourceFileError::Duplicate { kind: "pool", id });
            }
        }
        for entry in self.models {
            let id = entry.id();
            if resources.models.insert(id.clone(), entry.model).is_some() {
                return Err(ResourceFileError::Duplicate { kind: "model", id });
            }
        }
        for membership in self.memberships {
            let id = membership.id.clone();
            if resources.memberships.insert(id.clone(), membership).is_some() {
                return Err(ResourceFileError::Duplicate {
                    kind: "membership",
                    id,
                });
            }
        }
        Ok(resources)
    }
}

#[derive(Debug, Default)]
struct Resources {
    pools: HashMap<ResourceId, Pool>,
    models: HashMap<ResourceId, Model>,
    memberships: HashMap<ResourceId, Membership>,
}

impl Resources {
    fn events(&self) -> BTreeSet<EventKey> {
        let pools = self.pools.keys().map(|id| EventKey::Pool(id.clone()));
        let models = self.models.keys().map(|id| EventKey::Model(id.clone()));
        let memberships = self
            .memberships
            .keys()
            .map(|id| EventKey::Membership(id.clone()));
        pools.chain(models).chain(memberships).collect()
    }
}

/// Ordered stand-in for [`ChangeEvent`], so reload events come out sorted
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EventKey {
    Pool(ResourceId),
    Model(ResourceId),
    Membership(ResourceId),
}

impl From<EventKey> for ChangeEvent {
    fn from(key: EventKey) -> Self {
        match key {
            EventKey::Pool(id) => ChangeEvent::pool(id),
            EventKey::Model(id) => ChangeEvent::model(id),
            EventKey::Membership(id) => ChangeEvent::membership(id),
        }
    }
}

// =============================================================================
// Source
// =============================================================================

/// Serves resources from a TOML file, re-read on [`FileResourceSource::reload`]
pub struct FileResourceSource {
    path: PathBuf,
    resources: RwLock<Resources>,
}

impl FileResourceSource {
    /// Read the file once; the source starts with its contents
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ResourceFileError> {
        let path = path.into();
        let resources = ResourceFile::load(&path).await?.index()?;
        tracing::info!(
            path = %path.display(),
            pools = resources.pools.len(),
            models = resources.models.len(),
            memberships = resources.memberships.len(),
            "Loaded resources file"
        );
        Ok(Self {
            path,
            resources: RwLock::new(resources),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Change events for everything currently in the file
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.resources
            .read()
            .events()
            .into_iter()
            .map(ChangeEvent::from)
            .collect()
    }

    /// Re-read the file
    ///
    /// Returns events for every identity in the old or the new contents. On
    /// error the previous contents stay in place.
    pub async fn reload(&self) -> Result<Vec<ChangeEvent>, ResourceFileError> {
        let next = ResourceFile::load(&self.path).await?.index()?;

        let mut resources = self.resources.write();
        let mut keys = resources.events();
        keys.extend(next.events());
        *resources = next;
        drop(resources);

        tracing::info!(path = %self.path.display(), events = keys.len(), "Reloaded resources file");
        Ok(keys.into_iter().map(ChangeEvent::from).collect())
    }
}

#[async_trait]
impl ResourceSource for FileResourceSource {
    async fn fetch_pool(&self, id: &ResourceId) -> Result<Option<Pool>, FetchError> {
        Ok(self.resources.read().pools.get(id).cloned())
    }

    async fn fetch_model(&self, id: &ResourceId) -> Result<Option<Model>, FetchError> {
        Ok(self.resources.read().models.get(id).cloned())
    }

    async fn fetch_membership(&self, id: &ResourceId) -> Result<Option<Membership>, FetchError> {
        Ok(self.resources.read().memberships.get(id).cloned())
    }
}
