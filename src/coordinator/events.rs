//! Cluster event bus
//!
//! The liveness tracker publishes typed events; the integrity reconciler
//! consumes them from a single queue. Routing repairs through one channel
//! keeps component ownership acyclic and prevents concurrent repair storms
//! for the same chunk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A node's self-reported chunk holdings: file id → sorted chunk indices.
pub type Inventory = HashMap<String, Vec<u32>>;

/// Reference to a single chunk of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub file_id: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A node stopped heartbeating or announced shutdown. Informational;
    /// the re-replication loop handles the resulting under-replication.
    NodeDown { url: String },
    /// A dead node heartbeated again. Carries the inventory from that
    /// heartbeat when the node reported one.
    NodeRecovered {
        url: String,
        inventory: Option<Inventory>,
    },
    /// A node registered or re-registered.
    NodeRegistered { url: String },
    /// A node's inventory lost chunks since its previous heartbeat.
    InventoryChanged { url: String, removed: Vec<ChunkRef> },
}

/// Publishing half of the event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl EventBus {
    pub fn publish(&self, event: ClusterEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Cluster event dropped: reconciler has stopped");
        }
    }
}

/// Create the bus and the receiving end for the reconciler.
pub fn channel() -> (EventBus, mpsc::UnboundedReceiver<ClusterEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventBus { tx }, rx)
}
