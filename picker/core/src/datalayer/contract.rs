//! Telemetry Contracts
//!
//! A contract is the set of telemetry keys a plugin produces or consumes,
//! each with the value type it commits to. Snapshots carry the values a
//! backend reported on its last successful scrape.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Value type attached to a telemetry key
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "schema", rename_all = "snake_case")]
pub enum TelemetryType {
    Integer,
    Float,
    Boolean,
    /// Structured value identified by a schema name
    Record(String),
}

impl TelemetryType {
    pub fn record(schema: impl Into<String>) -> Self {
        Self::Record(schema.into())
    }
}

impl fmt::Display for TelemetryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "boolean"),
            Self::Record(schema) => write!(f, "record<{}>", schema),
        }
    }
}

/// A single reported telemetry value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryValue {
    Integer { value: i64 },
    Float { value: f64 },
    Boolean { value: bool },
    Record {
        schema: String,
        fields: serde_json::Value,
    },
}

impl TelemetryValue {
    pub fn integer(value: i64) -> Self {
        Self::Integer { value }
    }

    pub fn float(value: f64) -> Self {
        Self::Float { value }
    }

    pub fn boolean(value: bool) -> Self {
        Self::Boolean { value }
    }

    pub fn record(schema: impl Into<String>, fields: serde_json::Value) -> Self {
        Self::Record {
            schema: schema.into(),
            fields,
        }
    }

    /// The type this value satisfies
    pub fn value_type(&self) -> TelemetryType {
        match self {
            Self::Integer { .. } => TelemetryType::Integer,
            Self::Float { .. } => TelemetryType::Float,
            Self::Boolean { .. } => TelemetryType::Boolean,
            Self::Record { schema, .. } => TelemetryType::Record(schema.clone()),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Record { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

/// Declared telemetry keys and their types
///
/// Keys are kept ordered so that validation walks them deterministically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryContract {
    slots: BTreeMap<String, TelemetryType>,
}

impl TelemetryContract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert)
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, ty: TelemetryType) -> Self {
        self.insert(key, ty);
        self
    }

    /// Declare a key, returning the type previously declared for it
    pub fn insert(&mut self, key: impl Into<String>, ty: TelemetryType) -> Option<TelemetryType> {
        self.slots.insert(key.into(), ty)
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryType> {
        self.slots.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TelemetryType)> {
        self.slots.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, TelemetryType)> for TelemetryContract {
    fn from_iter<I: IntoIterator<Item = (K, TelemetryType)>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().map(|(k, ty)| (k.into(), ty)).collect(),
        }
    }
}

/// Telemetry reported by one backend at one point in time
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySnapshot {
    values: BTreeMap<String, TelemetryValue>,
    collected_at: SystemTime,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySnapshot {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            collected_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: TelemetryValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: TelemetryValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.values.get(key)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(TelemetryValue::as_integer)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(TelemetryValue::as_float)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TelemetryValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn collected_at(&self) -> SystemTime {
        self.collected_at
    }

    /// Time elapsed since collection; zero if the clock went backwards
    pub fn age(&self) -> Duration {
        self.collected_at.elapsed().unwrap_or_default()
    }

    /// Keys whose reported value does not satisfy the contract's declared type
    pub fn violations(&self, contract: &TelemetryContract) -> Vec<String> {
        contract
            .iter()
            .filter_map(|(key, ty)| match self.values.get(key) {
                Some(value) if value.value_type() != *ty => Some(key.clone()),
                _ => None,
            })
            .collect()
    }
}
