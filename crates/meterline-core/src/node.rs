//! Node, sample, and scalar types shared by the registry, store, and engines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned identifier for a persisted node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i64);

impl NodeId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a persisted node, derived from the element tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Device,
    DataItem,
    /// Any other kept tag
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Device => "Device",
            Self::DataItem => "DataItem",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar value as found in documents, samples, and the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Numeric view of the value; numeric text is parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) | Self::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Convert a JSON value; arrays and objects have no scalar form
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Node ready to be inserted, keyed by its canonical path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub kind: NodeKind,
    pub path: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl NewNode {
    /// Full property bag as persisted, including `node_type` and `path`
    pub fn props(&self) -> serde_json::Value {
        let mut props = serde_json::Map::new();
        props.insert("node_type".into(), self.kind.as_str().into());
        props.insert("path".into(), self.path.clone().into());
        for (key, value) in &self.properties {
            props.entry(key.clone()).or_insert_with(|| value.clone());
        }
        serde_json::Value::Object(props)
    }
}

/// A persisted node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub path: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn from_new(node_id: NodeId, node: NewNode) -> Self {
        Self {
            node_id,
            kind: node.kind,
            path: node.path,
            properties: node.properties,
        }
    }
}

/// The `(device, dataitem)` pair a time series is stored under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Series {
    pub device_id: NodeId,
    pub dataitem_id: NodeId,
}

impl Series {
    pub fn new(device_id: NodeId, dataitem_id: NodeId) -> Self {
        Self {
            device_id,
            dataitem_id,
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.dataitem_id)
    }
}

/// One stored sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub node_id: NodeId,
    pub dataitem_id: NodeId,
    pub time: DateTime<Utc>,
    pub value: Scalar,
}

impl SampleRecord {
    pub fn new(series: Series, time: DateTime<Utc>, value: impl Into<Scalar>) -> Self {
        Self {
            node_id: series.device_id,
            dataitem_id: series.dataitem_id,
            time,
            value: value.into(),
        }
    }

    pub fn series(&self) -> Series {
        Series::new(self.node_id, self.dataitem_id)
    }
}

/// A value at a point in time, as returned by series queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub time: DateTime<Utc>,
    pub value: Scalar,
}

impl TimedValue {
    pub fn new(time: DateTime<Utc>, value: impl Into<Scalar>) -> Self {
        Self {
            time,
            value: value.into(),
        }
    }
}
