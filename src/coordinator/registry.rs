//! Node registry
//!
//! The set of storage nodes the coordinator knows about. The url is the
//! canonical identity; the id is informational. Re-registering an existing
//! url refreshes the record and is reported back so the caller can audit
//! the returning node.

use crate::common::timestamp_now_millis;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub url: String,
    pub id: String,
    pub registered_at: u64,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Returns the record and whether this url was
    /// already registered.
    pub fn register(&self, url: &str, id: Option<&str>) -> (NodeRecord, bool) {
        let mut nodes = self.nodes.write().unwrap();
        let existed = nodes.contains_key(url);

        let id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_node_id(url),
        };
        let record = NodeRecord {
            url: url.to_string(),
            id,
            registered_at: timestamp_now_millis(),
        };
        nodes.insert(url.to_string(), record.clone());

        if existed {
            tracing::info!(url, id = %record.id, "Node re-registered");
        } else {
            tracing::info!(url, id = %record.id, total = nodes.len(), "Node registered");
        }

        (record, existed)
    }

    /// Remove a node. Returns false if the url was unknown.
    pub fn unregister(&self, url: &str) -> bool {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.remove(url) {
            Some(record) => {
                tracing::info!(url, id = %record.id, total = nodes.len(), "Node unregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, url: &str) -> bool {
        self.nodes.read().unwrap().contains_key(url)
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.nodes.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derive an id from the url's port plus the registration time.
fn generate_node_id(url: &str) -> String {
    let port = url
        .rsplit(':')
        .next()
        .and_then(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            (!digits.is_empty()).then_some(digits)
        })
        .unwrap_or_else(|| "0".to_string());
    format!("node-{}-{}", port, timestamp_now_millis())
}
