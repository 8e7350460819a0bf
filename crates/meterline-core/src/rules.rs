//! Derived-value rules
//!
//! An output rule names the cache keys it depends on, the key it produces,
//! and a value template. Templates are parsed once per device into a small
//! [`Expr`] tree:
//!
//! - `ACTIVE` is a literal
//! - `<status-cycle_time>` reads `<deviceId>-status-cycle_time` from the cache
//! - `Tool <tool-id> loaded` splices that value into the surrounding text
//! - `types.EXECUTION[<status-state>]` maps the value through an enumeration table
//!
//! Only the last `<..>` placeholder of a template is substituted. Evaluation
//! never mutates anything; a missing cache key yields no value and the rule is
//! skipped for that round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

use crate::cache::{CacheView, SampleCache};
use crate::node::Scalar;

/// Placeholder replaced by the device key in rule templates
pub const DEVICE_PLACEHOLDER: &str = "${deviceId}";

/// Enumeration tables by name, each mapping a raw value to an output value
pub type TypeTables = HashMap<String, HashMap<String, Scalar>>;

/// Output rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub key: String,
    pub value: String,
}

/// Value expression of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(String),
    /// Fully resolved cache key
    Lookup(String),
    Concat(Vec<Expr>),
    Table { table: String, key: Box<Expr> },
}

fn resolve(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_PLACEHOLDER, device_id)
}

impl Expr {
    /// Parse a value template for one device
    pub fn parse(template: &str, device_id: &str) -> Self {
        let template = resolve(template, device_id);

        if let Some(inner) = template
            .strip_prefix("types.")
            .and_then(|rest| rest.strip_suffix(">]"))
        {
            if let Some((table, suffix)) = inner.split_once("[<") {
                if !table.is_empty() && !suffix.contains('<') {
                    return Self::Table {
                        table: table.to_string(),
                        key: Box::new(Self::Lookup(format!("{}-{}", device_id, suffix))),
                    };
                }
            }
        }

        let Some(open) = template.rfind('<') else {
            return Self::Literal(template);
        };
        let Some(close) = template[open..].rfind('>').map(|i| open + i) else {
            return Self::Literal(template);
        };

        let prefix = &template[..open];
        let suffix = &template[open + 1..close];
        let rest = &template[close + 1..];
        let lookup = Self::Lookup(format!("{}-{}", device_id, suffix));

        if prefix.is_empty() && rest.is_empty() {
            return lookup;
        }
        let mut parts = Vec::new();
        if !prefix.is_empty() {
            parts.push(Self::Literal(prefix.to_string()));
        }
        parts.push(lookup);
        if !rest.is_empty() {
            parts.push(Self::Literal(rest.to_string()));
        }
        Self::Concat(parts)
    }

    /// Evaluate against a cache; `None` when a referenced key has no value
    pub fn eval(&self, cache: &dyn CacheView, types: &TypeTables) -> Option<Scalar> {
        match self {
            Self::Literal(text) => Some(Scalar::Text(text.clone())),
            Self::Lookup(key) => {
                let value = cache.get(key).map(|v| v.value);
                if value.is_none() {
                    trace!(key = %key, "No cached value yet");
                }
                value
            }
            Self::Concat(parts) => {
                let mut text = String::new();
                for part in parts {
                    text.push_str(&part.eval(cache, types)?.to_string());
                }
                Some(Scalar::Text(text))
            }
            Self::Table { table, key } => {
                let raw = key.eval(cache, types)?;
                types.get(table)?.get(&raw.to_string()).cloned()
            }
        }
    }
}

/// A rule resolved for one device
#[derive(Debug, Clone)]
pub struct Output {
    pub key: String,
    pub depends_on: Vec<String>,
    pub expr: Expr,
    types: Arc<TypeTables>,
}

impl Output {
    pub fn new(device_id: &str, spec: &OutputSpec, types: Arc<TypeTables>) -> Self {
        Self {
            key: resolve(&spec.key, device_id),
            depends_on: spec
                .depends_on
                .iter()
                .map(|d| resolve(d, device_id))
                .collect(),
            expr: Expr::parse(&spec.value, device_id),
            types,
        }
    }

    pub fn value(&self, cache: &dyn CacheView) -> Option<Scalar> {
        self.expr.eval(cache, &self.types)
    }
}

/// Resolve every output template for one device
pub fn outputs(device_id: &str, specs: &[OutputSpec], types: Arc<TypeTables>) -> Vec<Output> {
    specs
        .iter()
        .map(|spec| Output::new(device_id, spec, types.clone()))
        .collect()
}

/// A value produced by a rule
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub key: String,
    pub value: Scalar,
    pub time: DateTime<Utc>,
}

/// Rules for a set of devices
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    outputs: Vec<Output>,
}

impl RuleEngine {
    pub fn new(devices: &[String], specs: &[OutputSpec], types: TypeTables) -> Self {
        let types = Arc::new(types);
        Self {
            outputs: devices
                .iter()
                .flat_map(|device| outputs(device, specs, types.clone()))
                .collect(),
        }
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Evaluate every rule against one cache snapshot
    pub fn evaluate(&self, cache: &dyn CacheView, time: DateTime<Utc>) -> Vec<Derived> {
        self.outputs
            .iter()
            .filter_map(|output| {
                output.value(cache).map(|value| Derived {
                    key: output.key.clone(),
                    value,
                    time,
                })
            })
            .collect()
    }

    /// Re-evaluate the rules depending on any changed key.
    ///
    /// New values are written to the cache; only values that differ from the
    /// cached ones are returned.
    pub fn on_update(&self, changed: &[String], cache: &SampleCache, time: DateTime<Utc>) -> Vec<Derived> {
        let changed: HashSet<&str> = changed.iter().map(String::as_str).collect();
        let mut derived = Vec::new();
        for output in &self.outputs {
            if !output.depends_on.iter().any(|d| changed.contains(d.as_str())) {
                continue;
            }
            let Some(value) = output.value(cache) else {
                continue;
            };
            if cache.set(output.key.clone(), value.clone(), time) {
                derived.push(Derived {
                    key: output.key.clone(),
                    value,
                    time,
                });
            }
        }
        derived
    }
}
