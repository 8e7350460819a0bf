//! Meterline Core - Topology normalization, node registry, and derived values
//!
//! This crate provides the foundational pieces of the Meterline system:
//! - Probe document decoding (XML or JSON) into a generic tree
//! - Document walking and canonical path computation for devices and data items
//! - Node registry with conflict-tolerant upserts against a pluggable store
//! - Latest-value cache, sample recorder, and derived-value rules
//! - Lifetime counter reconciliation from resettable delta counters

pub mod cache;
pub mod counter;
pub mod document;
pub mod node;
pub mod path;
pub mod recorder;
pub mod registry;
pub mod rules;
pub mod shutdown;
pub mod store;
pub mod walker;

pub use cache::{CacheView, CachedValue, SampleCache};
pub use counter::{CounterEngine, CounterError, CounterIds, CounterSpec, Phase};
pub use document::{Document, DocumentError, Format};
pub use node::{NewNode, Node, NodeId, NodeKind, SampleRecord, Scalar, Series, TimedValue};
pub use path::{CanonicalElement, PathRules, PlainSteps};
pub use recorder::Recorder;
pub use registry::{Index, IngestReport, Registry, RegistryError};
pub use rules::{Derived, Expr, Output, OutputSpec, RuleEngine, TypeTables};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use store::{InMemoryStore, Store, StoreError, StoreResult};
pub use walker::{Attributes, Element, Walker};
