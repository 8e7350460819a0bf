//! Node registry
//!
//! Turns canonicalized elements into persisted nodes and keeps the in-memory
//! indexes that map paths, node ids, and element ids onto each other.
//!
//! Node creation is an insert keyed by path that falls back to a lookup when
//! the store reports a uniqueness conflict. The store enforces path
//! uniqueness, so any number of tasks or processes may ingest the same
//! document concurrently and all of them resolve to the same node ids.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::document::Document;
use crate::node::{NewNode, Node, NodeId, NodeKind, Series};
use crate::path::{CanonicalElement, PathRules};
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Store error for {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("Node at {0} conflicted on insert but cannot be found")]
    Vanished(String),
    #[error("Device {device:?} of {path} is not registered")]
    MissingDevice {
        device: Option<String>,
        path: String,
    },
}

/// Outcome of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub node_id: NodeId,
    /// False when the node already existed
    pub created: bool,
}

/// Counts from one ingestion pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub elements: usize,
    pub created: usize,
    pub existing: usize,
}

/// Ids resolved for one element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementIds {
    pub device_id: NodeId,
    pub self_id: NodeId,
}

impl ElementIds {
    pub fn series(&self) -> Series {
        Series::new(self.device_id, self.self_id)
    }
}

/// Path and id indexes, rebuilt on every ingestion pass
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub path_to_node: HashMap<String, Node>,
    pub id_to_node: HashMap<NodeId, Node>,
    /// Keyed by the element's `id` attribute, or its path when it has none
    pub element_ids: HashMap<String, ElementIds>,
    /// Elements with `device_id` and `dataitem_id` back-filled
    pub elements: Vec<CanonicalElement>,
}

impl Index {
    /// Build the indexes and back-fill ids onto the elements.
    ///
    /// Every DataItem must belong to a registered device.
    pub fn build(nodes: Vec<Node>, elements: Vec<CanonicalElement>) -> Result<Self, RegistryError> {
        let mut index = Index::default();
        for node in nodes {
            index.id_to_node.insert(node.node_id, node.clone());
            index.path_to_node.insert(node.path.clone(), node);
        }

        for mut element in elements {
            let self_id = index.node_id(&element.path);

            let device_id = match element.kind {
                NodeKind::Device => self_id,
                NodeKind::DataItem => {
                    let device_id = element.device.as_deref().and_then(|d| index.node_id(d));
                    if device_id.is_none() {
                        return Err(RegistryError::MissingDevice {
                            device: element.device.clone(),
                            path: element.path.clone(),
                        });
                    }
                    element.dataitem_id = self_id;
                    device_id
                }
                NodeKind::Other(_) => element.device.as_deref().and_then(|d| index.node_id(d)),
            };
            element.device_id = device_id;

            if let (Some(device_id), Some(self_id)) = (device_id, self_id) {
                index
                    .element_ids
                    .insert(element.element_id(), ElementIds { device_id, self_id });
            }
            index.elements.push(element);
        }
        Ok(index)
    }

    pub fn node_id(&self, path: &str) -> Option<NodeId> {
        self.path_to_node.get(path).map(|n| n.node_id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.id_to_node.get(&id)
    }

    /// Series of a DataItem addressed relative to its device path
    pub fn series_at(&self, device: &str, relative: &str) -> Option<Series> {
        let device_id = self.node_id(device)?;
        let dataitem_id = self.node_id(&format!("{}/{}", device, relative))?;
        Some(Series::new(device_id, dataitem_id))
    }

    /// Element id and series of every registered DataItem
    pub fn dataitems(&self) -> impl Iterator<Item = (&str, Series)> + '_ {
        self.element_ids
            .iter()
            .filter(|(_, ids)| {
                self.node(ids.self_id)
                    .is_some_and(|node| node.kind == NodeKind::DataItem)
            })
            .map(|(key, ids)| (key.as_str(), ids.series()))
    }
}

/// Node properties persisted for an element
pub fn node_properties(element: &CanonicalElement) -> serde_json::Map<String, serde_json::Value> {
    let attributes = element.element.attributes.iter();
    let mut properties: serde_json::Map<String, serde_json::Value> = match element.kind {
        NodeKind::DataItem => attributes
            .filter(|(key, _)| !matches!(*key, "id" | "name" | "device"))
            .map(|(key, value)| (key.to_string(), value.to_json()))
            .collect(),
        _ => attributes
            .map(|(key, value)| (key.to_string(), value.to_json()))
            .collect(),
    };

    if element.kind == NodeKind::Device {
        let name = element.element.attr("name").unwrap_or_default();
        let uuid = element.element.attr("uuid").unwrap_or_default();
        properties.insert("name_uuid".into(), format!("{} ({})", name, uuid).into());
    }
    if let Some(text) = &element.element.text {
        properties.entry("text").or_insert_with(|| text.clone().into());
    }
    properties
}

/// Registers topology documents against a store
pub struct Registry {
    store: Arc<dyn Store>,
    rules: PathRules,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, rules: PathRules) -> Self {
        Self { store, rules }
    }

    pub fn rules(&self) -> &PathRules {
        &self.rules
    }

    /// Walk and canonicalize a document; elements without a path are dropped
    pub fn canonicalize(&self, document: &Document) -> Vec<CanonicalElement> {
        self.rules
            .walker()
            .walk(document)
            .into_iter()
            .map(|element| self.rules.canonicalize(element))
            .filter(|element| {
                if element.path.is_empty() {
                    debug!(tag = %element.element.tag, "Skipping element without a canonical path");
                    return false;
                }
                true
            })
            .collect()
    }

    /// One node per path, in first-seen order; the last element at a path wins
    pub fn unique_nodes(elements: &[CanonicalElement]) -> Vec<NewNode> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut nodes: Vec<NewNode> = Vec::new();
        for element in elements {
            let node = NewNode {
                kind: element.kind.clone(),
                path: element.path.clone(),
                properties: node_properties(element),
            };
            match positions.get(element.path.as_str()) {
                Some(&at) => nodes[at] = node,
                None => {
                    positions.insert(&element.path, nodes.len());
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    /// Insert a node, or resolve the existing one when its path is taken
    pub async fn upsert(&self, node: &NewNode) -> Result<Upserted, RegistryError> {
        match self.store.insert_node(node).await {
            Ok(node_id) => {
                debug!(path = %node.path, node_id = %node_id, "Inserted node");
                Ok(Upserted {
                    node_id,
                    created: true,
                })
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(path = %node.path, "Node exists, resolving by path");
                match self.store.lookup_node(&node.path).await {
                    Ok(Some(node_id)) => Ok(Upserted {
                        node_id,
                        created: false,
                    }),
                    Ok(None) => Err(RegistryError::Vanished(node.path.clone())),
                    Err(source) => {
                        error!(path = %node.path, error = %source, "Failed to look up node");
                        Err(RegistryError::Store {
                            path: node.path.clone(),
                            source,
                        })
                    }
                }
            }
            Err(source) => {
                error!(path = %node.path, error = %source, "Failed to insert node");
                Err(RegistryError::Store {
                    path: node.path.clone(),
                    source,
                })
            }
        }
    }

    /// Register every node of a document and build a fresh index
    pub async fn ingest(&self, document: &Document) -> Result<(Index, IngestReport), RegistryError> {
        let elements = self.canonicalize(document);
        let new_nodes = Self::unique_nodes(&elements);

        let mut report = IngestReport {
            elements: elements.len(),
            ..Default::default()
        };
        let mut nodes = Vec::with_capacity(new_nodes.len());
        for new_node in new_nodes {
            let upserted = self.upsert(&new_node).await?;
            if upserted.created {
                report.created += 1;
            } else {
                report.existing += 1;
            }
            nodes.push(Node::from_new(upserted.node_id, new_node));
        }

        let index = Index::build(nodes, elements)?;
        info!(
            elements = report.elements,
            created = report.created,
            existing = report.existing,
            "Ingested topology"
        );
        Ok((index, report))
    }
}
