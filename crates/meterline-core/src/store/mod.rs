//! Persistent store contract
//!
//! The [`Store`] trait is everything the registry and the engines need from a
//! backend. Implementations must be `Send + Sync` so one store can be shared
//! by every task of the daemon.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ping`](Store::ping) | Readiness probe for the startup wait loop |
//! | [`insert_node`](Store::insert_node) | Insert a node keyed by path, [`StoreError::Conflict`] on duplicates |
//! | [`lookup_node`](Store::lookup_node) | Find a node id by path |
//! | [`append_samples`](Store::append_samples) | Append raw samples |
//! | [`upsert_samples`](Store::upsert_samples) | Write samples keyed by series and time |
//! | [`latest_before`](Store::latest_before) | Last value strictly before a time |
//! | [`earliest`](Store::earliest) | First value of a series |
//! | [`range`](Store::range) | Values in a window plus the last one before it |

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::node::{NewNode, NodeId, SampleRecord, Series, TimedValue};

pub use memory::InMemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Node already exists at path {path}")]
    Conflict { path: String },
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Succeeds once the backend accepts queries
    async fn ping(&self) -> StoreResult<()>;

    /// Insert a node; a node with the same path yields [`StoreError::Conflict`]
    async fn insert_node(&self, node: &NewNode) -> StoreResult<NodeId>;

    async fn lookup_node(&self, path: &str) -> StoreResult<Option<NodeId>>;

    async fn append_samples(&self, records: &[SampleRecord]) -> StoreResult<()>;

    /// Write samples, replacing any record with the same series and time
    async fn upsert_samples(&self, records: &[SampleRecord]) -> StoreResult<()>;

    async fn latest_before(
        &self,
        series: Series,
        time: DateTime<Utc>,
    ) -> StoreResult<Option<TimedValue>>;

    async fn earliest(&self, series: Series) -> StoreResult<Option<TimedValue>>;

    /// Values with `start <= time <= end`, preceded by the last value before `start`
    async fn range(
        &self,
        series: Series,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TimedValue>>;
}
