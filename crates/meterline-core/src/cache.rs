//! Latest-value cache shared by the recorder and the rule engine

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::node::Scalar;

/// Latest known value of a key
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Scalar,
    pub time: DateTime<Utc>,
}

/// Read access to a key/value cache
pub trait CacheView {
    fn get(&self, key: &str) -> Option<CachedValue>;
}

impl CacheView for HashMap<String, CachedValue> {
    fn get(&self, key: &str) -> Option<CachedValue> {
        HashMap::get(self, key).cloned()
    }
}

/// Process-wide cache, last writer wins per key
#[derive(Debug, Default)]
pub struct SampleCache {
    values: RwLock<HashMap<String, CachedValue>>,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; returns true when it differs from the previous one
    pub fn set(&self, key: impl Into<String>, value: Scalar, time: DateTime<Utc>) -> bool {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        let previous = values.insert(key.into(), CachedValue { value: value.clone(), time });
        previous.map_or(true, |p| p.value != value)
    }

    /// Copy of the whole cache, for evaluation against a fixed snapshot
    pub fn snapshot(&self) -> HashMap<String, CachedValue> {
        self.values.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheView for SampleCache {
    fn get(&self, key: &str) -> Option<CachedValue> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}
