use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A network interface through which a neighbor is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInterface {
    /// Interface technology, e.g. "ethernet" or "bluetooth".
    pub kind: String,
    /// Technology-specific address.
    pub identifier: String,
}

/// Snapshot of a neighboring participant as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NodeInterface>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_interface(mut self, kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        self.interfaces.push(NodeInterface {
            kind: kind.into(),
            identifier: identifier.into(),
        });
        self
    }
}
