//! Telemetry Dependency Graph
//!
//! Validates the declared contracts of every data plugin and assembles them
//! into an acyclic graph. Producers are promoted first, consumers after;
//! a plugin is promoted once every key it consumes has a promoted producer.
//!
//! ```text
//!   [metrics-source] --queued-requests--> [least-queue-picker]
//!          |
//!          +--kv-cache-utilization--> [headroom] --headroom--> [scorer]
//! ```
//!
//! Nodes live in an arena and reference each other by [`NodeId`], so the
//! graph carries no reference cycles. Arena order is promotion order, which
//! is always a valid topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::contract::{TelemetryContract, TelemetryType};

// ============================================================================
// Plugin Traits
// ============================================================================

/// Anything that takes part in the telemetry graph
pub trait DataPlugin: Send + Sync {
    /// Unique plugin name
    fn name(&self) -> &str;

    /// Keys this plugin reads
    fn consumes(&self) -> TelemetryContract {
        TelemetryContract::new()
    }
}

/// Where a producer's data comes from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceKind {
    /// Refreshed per backend on the telemetry loop
    #[default]
    PoolLevel,
    /// Computed for each routing request
    RequestSpecific,
}

/// A plugin that writes telemetry keys
pub trait DataProducer: DataPlugin {
    /// Keys this plugin writes
    fn produces(&self) -> TelemetryContract;

    fn source_kind(&self) -> DataSourceKind {
        DataSourceKind::PoolLevel
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a set of plugins cannot form a graph
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plugin name '{0}' is declared more than once")]
    DuplicatePlugin(String),

    #[error("key '{key}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        key: String,
        first: String,
        second: String,
    },

    #[error("'{consumer}' consumes '{key}' but no producer declares it")]
    UnsatisfiedDependency { consumer: String, key: String },

    #[error(
        "type mismatch for '{key}': '{expected_by}' declares {expected}, '{found_by}' declares {found}"
    )]
    TypeMismatch {
        key: String,
        expected: TelemetryType,
        expected_by: String,
        found: TelemetryType,
        found_by: String,
    },

    #[error("circular dependency among plugins: {}", plugins.join(", "))]
    CircularDependency { plugins: Vec<String> },

    #[error("plugin '{0}' is not part of the graph")]
    UnregisteredPlugin(String),
}

// ============================================================================
// Nodes
// ============================================================================

/// Arena index of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A plugin as registered in the graph
#[derive(Clone)]
pub enum PluginHandle {
    Producer(Arc<dyn DataProducer>),
    Consumer(Arc<dyn DataPlugin>),
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Producer(p) => p.name(),
            Self::Consumer(c) => c.name(),
        }
    }

    fn consumes(&self) -> TelemetryContract {
        match self {
            Self::Producer(p) => p.consumes(),
            Self::Consumer(c) => c.consumes(),
        }
    }

    fn produces(&self) -> TelemetryContract {
        match self {
            Self::Producer(p) => p.produces(),
            Self::Consumer(_) => TelemetryContract::new(),
        }
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer(p) => f.debug_tuple("Producer").field(&p.name()).finish(),
            Self::Consumer(c) => f.debug_tuple("Consumer").field(&c.name()).finish(),
        }
    }
}

/// One plugin plus its resolved edges
#[derive(Debug)]
pub struct PluginNode {
    id: NodeId,
    name: String,
    plugin: PluginHandle,
    consumes: TelemetryContract,
    produces: TelemetryContract,
    /// Consumed key -> producing node
    upstream: BTreeMap<String, NodeId>,
    downstream: BTreeSet<NodeId>,
}

impl PluginNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &PluginHandle {
        &self.plugin
    }

    pub fn consumes(&self) -> &TelemetryContract {
        &self.consumes
    }

    pub fn produces(&self) -> &TelemetryContract {
        &self.produces
    }

    /// Producing node for each consumed key
    pub fn upstream(&self) -> &BTreeMap<String, NodeId> {
        &self.upstream
    }

    /// Distinct producing nodes
    pub fn upstream_nodes(&self) -> BTreeSet<NodeId> {
        self.upstream.values().copied().collect()
    }

    pub fn downstream(&self) -> &BTreeSet<NodeId> {
        &self.downstream
    }

    pub fn is_root(&self) -> bool {
        self.consumes.is_empty()
    }

    pub fn is_producer(&self) -> bool {
        matches!(self.plugin, PluginHandle::Producer(_))
    }

    pub fn source_kind(&self) -> Option<DataSourceKind> {
        match &self.plugin {
            PluginHandle::Producer(p) => Some(p.source_kind()),
            PluginHandle::Consumer(_) => None,
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Validated, acyclic telemetry dependency graph
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<PluginNode>,
    by_name: HashMap<String, NodeId>,
    roots: Vec<NodeId>,
}

impl DependencyGraph {
    /// Validate contracts and assemble the graph
    ///
    /// Either returns a graph in which every consumed key is wired to its
    /// single producer, or the first validation error found. Building is
    /// deterministic for a given input order.
    pub fn build(
        producers: &[Arc<dyn DataProducer>],
        consumers: &[Arc<dyn DataPlugin>],
    ) -> Result<Self, ValidationError> {
        validate(producers, consumers)?;

        let mut assembly = Assembly::default();
        assembly.promote_all(
            producers
                .iter()
                .cloned()
                .map(PluginHandle::Producer)
                .collect(),
        )?;
        assembly.promote_all(
            consumers
                .iter()
                .cloned()
                .map(PluginHandle::Consumer)
                .collect(),
        )?;

        let roots = assembly
            .nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| n.id)
            .collect();

        debug!(nodes = assembly.nodes.len(), "Telemetry dependency graph built");

        Ok(Self {
            nodes: assembly.nodes,
            by_name: assembly.by_name,
            roots,
        })
    }

    /// Nodes with no consumed keys
    pub fn roots(&self) -> impl Iterator<Item = &PluginNode> {
        self.roots.iter().map(|id| &self.nodes[id.0])
    }

    pub fn node(&self, id: NodeId) -> Option<&PluginNode> {
        self.nodes.get(id.0)
    }

    pub fn get(&self, name: &str) -> Option<&PluginNode> {
        self.by_name.get(name).map(|id| &self.nodes[id.0])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every key written by producers of the given kind
    pub fn produced(&self, kind: DataSourceKind) -> TelemetryContract {
        self.nodes
            .iter()
            .filter(|n| n.source_kind() == Some(kind))
            .flat_map(|n| n.produces.iter().map(|(k, ty)| (k.clone(), ty.clone())))
            .collect()
    }

    /// Check that `plugin` is the consumer registered under its name and
    /// that every key it reads is wired to a producer of the declared type
    pub fn admit<P>(&self, plugin: &P) -> Result<&PluginNode, ValidationError>
    where
        P: DataPlugin + ?Sized,
    {
        let name = plugin.name();
        let node = self
            .get(name)
            .ok_or_else(|| ValidationError::UnregisteredPlugin(name.to_string()))?;

        for (key, ty) in plugin.consumes().iter() {
            let Some(producer) = node.upstream.get(key).map(|id| &self.nodes[id.0]) else {
                return Err(ValidationError::UnsatisfiedDependency {
                    consumer: name.to_string(),
                    key: key.clone(),
                });
            };
            if let Some(expected) = producer.produces.get(key).filter(|expected| *expected != ty) {
                return Err(ValidationError::TypeMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    expected_by: producer.name.clone(),
                    found: ty.clone(),
                    found_by: name.to_string(),
                });
            }
        }
        Ok(node)
    }

    /// All nodes, each after every node it depends on
    pub fn execution_order(&self) -> impl Iterator<Item = &PluginNode> {
        self.nodes.iter()
    }

    /// The named node plus everything it transitively depends on, in
    /// execution order
    pub fn resolve_order(&self, name: &str) -> Option<Vec<&PluginNode>> {
        let start = *self.by_name.get(name)?;
        let reached = self.walk(start, |node| node.upstream_nodes());
        Some(self.in_order(&reached))
    }

    /// Everything that transitively depends on the named node, in execution
    /// order, excluding the node itself
    pub fn downstream_of(&self, name: &str) -> Option<Vec<&PluginNode>> {
        let start = *self.by_name.get(name)?;
        let mut reached = self.walk(start, |node| node.downstream.clone());
        reached.remove(&start);
        Some(self.in_order(&reached))
    }

    fn walk<F>(&self, start: NodeId, next: F) -> HashSet<NodeId>
    where
        F: Fn(&PluginNode) -> BTreeSet<NodeId>,
    {
        let mut seen = HashSet::from([start]);
        let mut frontier = VecDeque::from([start]);
        while let Some(id) = frontier.pop_front() {
            for neighbour in next(&self.nodes[id.0]) {
                if seen.insert(neighbour) {
                    frontier.push_back(neighbour);
                }
            }
        }
        seen
    }

    fn in_order(&self, ids: &HashSet<NodeId>) -> Vec<&PluginNode> {
        self.nodes.iter().filter(|n| ids.contains(&n.id)).collect()
    }
}

/// Validate contracts and assemble a [`DependencyGraph`]
pub fn build(
    producers: &[Arc<dyn DataProducer>],
    consumers: &[Arc<dyn DataPlugin>],
) -> Result<DependencyGraph, ValidationError> {
    DependencyGraph::build(producers, consumers)
}

/// Check names, producers, and types before any node is built
fn validate(
    producers: &[Arc<dyn DataProducer>],
    consumers: &[Arc<dyn DataPlugin>],
) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    let all_names = producers
        .iter()
        .map(|p| p.name())
        .chain(consumers.iter().map(|c| c.name()));
    for name in all_names {
        if !names.insert(name) {
            return Err(ValidationError::DuplicatePlugin(name.to_string()));
        }
    }

    let declarations: Vec<(&str, TelemetryContract)> = producers
        .iter()
        .map(|p| (p.name(), p.consumes()))
        .chain(consumers.iter().map(|c| (c.name(), c.consumes())))
        .collect();

    // key -> (type, first declaring plugin)
    let mut consumed: BTreeMap<&str, (&TelemetryType, &str)> = BTreeMap::new();
    for (plugin, contract) in &declarations {
        for (key, ty) in contract.iter() {
            match consumed.get(key.as_str()) {
                Some((other, other_by)) if *other != ty => {
                    return Err(ValidationError::TypeMismatch {
                        key: key.clone(),
                        expected: (*other).clone(),
                        expected_by: other_by.to_string(),
                        found: ty.clone(),
                        found_by: plugin.to_string(),
                    })
                }
                Some(_) => {}
                None => {
                    consumed.insert(key.as_str(), (ty, *plugin));
                }
            }
        }
    }

    let mut produced: BTreeMap<String, (TelemetryType, String)> = BTreeMap::new();
    for producer in producers {
        for (key, ty) in producer.produces().iter() {
            if let Some((_, first)) = produced.get(key) {
                return Err(ValidationError::DuplicateProducer {
                    key: key.clone(),
                    first: first.clone(),
                    second: producer.name().to_string(),
                });
            }
            produced.insert(key.clone(), (ty.clone(), producer.name().to_string()));
        }
    }

    for (key, (ty, consumer)) in consumed {
        let Some((expected, expected_by)) = produced.get(key) else {
            return Err(ValidationError::UnsatisfiedDependency {
                consumer: consumer.to_string(),
                key: key.to_string(),
            });
        };
        if expected != ty {
            return Err(ValidationError::TypeMismatch {
                key: key.to_string(),
                expected: expected.clone(),
                expected_by: expected_by.clone(),
                found: ty.clone(),
                found_by: consumer.to_string(),
            });
        }
    }

    Ok(())
}

/// Arena under construction
#[derive(Default)]
struct Assembly {
    nodes: Vec<PluginNode>,
    /// Doubles as the visited set: a name is present once promoted
    by_name: HashMap<String, NodeId>,
    produced_by: HashMap<String, NodeId>,
}

impl Assembly {
    /// Promote a worklist of plugins, repeating passes until it drains
    ///
    /// A pass that promotes nothing means the remaining plugins wait on each
    /// other.
    fn promote_all(&mut self, mut pending: Vec<PluginHandle>) -> Result<(), ValidationError> {
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::with_capacity(before);

            for plugin in pending {
                if self.by_name.contains_key(plugin.name()) {
                    continue;
                }
                let consumes = plugin.consumes();
                let upstream: Option<BTreeMap<String, NodeId>> = consumes
                    .keys()
                    .map(|key| self.produced_by.get(key).map(|id| (key.clone(), *id)))
                    .collect();
                match upstream {
                    Some(upstream) => self.promote(plugin, consumes, upstream),
                    None => waiting.push(plugin),
                }
            }

            if waiting.len() == before {
                return Err(ValidationError::CircularDependency {
                    plugins: waiting.iter().map(|p| p.name().to_string()).collect(),
                });
            }
            pending = waiting;
        }
        Ok(())
    }

    fn promote(
        &mut self,
        plugin: PluginHandle,
        consumes: TelemetryContract,
        upstream: BTreeMap<String, NodeId>,
    ) {
        let id = NodeId(self.nodes.len());
        for producer in upstream.values() {
            self.nodes[producer.0].downstream.insert(id);
        }

        let produces = plugin.produces();
        for key in produces.keys() {
            self.produced_by.insert(key.clone(), id);
        }

        let name = plugin.name().to_string();
        self.by_name.insert(name.clone(), id);
        self.nodes.push(PluginNode {
            id,
            name,
            plugin,
            consumes,
            produces,
            upstream,
            downstream: BTreeSet::new(),
        });
    }
}
