//! In-memory [`Store`] implementation for tests and the `memory` store kind.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Each series is a `Vec` kept
//! sorted by time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::node::{NewNode, NodeId, SampleRecord, Series, TimedValue};

use super::{Store, StoreError, StoreResult};

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory store
pub struct InMemoryStore {
    nodes: RwLock<HashMap<String, (NodeId, NewNode)>>,
    history: RwLock<HashMap<Series, Vec<TimedValue>>>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    /// Stored node by path, for inspection
    pub fn node(&self, path: &str) -> Option<(NodeId, NewNode)> {
        self.nodes.read().ok()?.get(path).cloned()
    }

    /// Every value of a series in time order, for inspection
    pub fn samples(&self, series: Series) -> Vec<TimedValue> {
        self.history
            .read()
            .ok()
            .and_then(|history| history.get(&series).cloned())
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_node(&self, node: &NewNode) -> StoreResult<NodeId> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        if nodes.contains_key(&node.path) {
            return Err(StoreError::Conflict {
                path: node.path.clone(),
            });
        }
        let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst));
        nodes.insert(node.path.clone(), (id, node.clone()));
        Ok(id)
    }

    async fn lookup_node(&self, path: &str) -> StoreResult<Option<NodeId>> {
        let nodes = self.nodes.read().map_err(poisoned)?;
        Ok(nodes.get(path).map(|(id, _)| *id))
    }

    async fn append_samples(&self, records: &[SampleRecord]) -> StoreResult<()> {
        let mut history = self.history.write().map_err(poisoned)?;
        for record in records {
            let series = history.entry(record.series()).or_default();
            let at = series.partition_point(|v| v.time < record.time);
            if series.get(at).is_some_and(|v| v.time == record.time) {
                continue;
            }
            series.insert(at, TimedValue::new(record.time, record.value.clone()));
        }
        Ok(())
    }

    async fn upsert_samples(&self, records: &[SampleRecord]) -> StoreResult<()> {
        let mut history = self.history.write().map_err(poisoned)?;
        for record in records {
            let series = history.entry(record.series()).or_default();
            let at = series.partition_point(|v| v.time < record.time);
            match series.get_mut(at) {
                Some(existing) if existing.time == record.time => {
                    existing.value = record.value.clone();
                }
                _ => series.insert(at, TimedValue::new(record.time, record.value.clone())),
            }
        }
        Ok(())
    }

    async fn latest_before(
        &self,
        series: Series,
        time: DateTime<Utc>,
    ) -> StoreResult<Option<TimedValue>> {
        let history = self.history.read().map_err(poisoned)?;
        Ok(history.get(&series).and_then(|values| {
            let at = values.partition_point(|v| v.time < time);
            at.checked_sub(1).map(|i| values[i].clone())
        }))
    }

    async fn earliest(&self, series: Series) -> StoreResult<Option<TimedValue>> {
        let history = self.history.read().map_err(poisoned)?;
        Ok(history.get(&series).and_then(|values| values.first().cloned()))
    }

    async fn range(
        &self,
        series: Series,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TimedValue>> {
        let history = self.history.read().map_err(poisoned)?;
        let Some(values) = history.get(&series) else {
            return Ok(Vec::new());
        };
        let first = values.partition_point(|v| v.time < start);
        let last = values.partition_point(|v| v.time <= end);
        let from = first.saturating_sub(1);
        Ok(values[from..last.max(from)].to_vec())
    }
}
