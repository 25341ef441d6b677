//! Node liveness tracking
//!
//! Receives push heartbeats from storage nodes, keeps one health record per
//! node (alive/dead, last-seen time, uptime accounting, last reported
//! inventory, capacity metrics), and publishes state-change events on the
//! cluster bus. A periodic sweep marks nodes dead once they miss the
//! heartbeat timeout.
//!
//! Records live behind individual locks inside the shared map, so
//! heartbeats from distinct nodes proceed independently while two
//! heartbeats from the same node serialize on its record.

use crate::common::{timestamp_now_millis, Result};
use crate::coordinator::events::{ChunkRef, ClusterEvent, EventBus, Inventory};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

/// Heartbeat payload pushed by a storage node.
///
/// Unknown fields are rejected to catch schema drift between coordinator
/// and nodes early.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Heartbeat {
    pub id: String,
    pub url: String,
    pub status: NodeStatus,
    /// Node-side unix-ms send time
    pub timestamp: u64,
    #[serde(default)]
    pub inventory: Option<Inventory>,
    #[serde(default)]
    pub total_chunks: Option<u64>,
    #[serde(default, rename = "storageUsedMB")]
    pub storage_used_mb: Option<f64>,
    #[serde(default, rename = "freeSpaceMB")]
    pub free_space_mb: Option<u64>,
    #[serde(default)]
    pub can_write: Option<bool>,
}

/// Advisory command attached to a heartbeat acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<NodeCommand>>,
}

/// Read-only view of one node's health record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthView {
    pub url: String,
    pub id: String,
    pub alive: bool,
    pub first_seen: u64,
    pub last_heartbeat: u64,
    pub total_heartbeats: u64,
    pub uptime_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "storageUsedMB")]
    pub storage_used_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "freeSpaceMB")]
    pub free_space_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_write: Option<bool>,
}

/// Per-node health record. Created on first heartbeat, never destroyed
/// while the coordinator runs (long-term uptime stats).
#[derive(Debug)]
struct NodeHealth {
    url: String,
    node_id: String,
    first_seen: u64,
    last_heartbeat: u64,
    alive: bool,
    total_heartbeats: u64,
    total_downtime_ms: u64,
    /// Valid while dead; 0 means unset
    downtime_start: u64,
    last_inventory: Option<Inventory>,
    total_chunks: Option<u64>,
    storage_used_mb: Option<f64>,
    free_space_mb: Option<u64>,
    can_write: Option<bool>,
}

impl NodeHealth {
    fn new(url: String, node_id: String, now: u64) -> Self {
        Self {
            url,
            node_id,
            first_seen: now,
            last_heartbeat: now,
            alive: true,
            total_heartbeats: 0,
            total_downtime_ms: 0,
            downtime_start: 0,
            last_inventory: None,
            total_chunks: None,
            storage_used_mb: None,
            free_space_mb: None,
            can_write: None,
        }
    }

    fn mark_dead(&mut self, now: u64) {
        if self.alive {
            self.alive = false;
            self.downtime_start = now;
        }
    }

    fn uptime_percent(&self, now: u64) -> f64 {
        let total = now.saturating_sub(self.first_seen);
        if total == 0 {
            return 100.0;
        }
        let mut downtime = self.total_downtime_ms;
        if !self.alive && self.downtime_start > 0 {
            downtime += now.saturating_sub(self.downtime_start);
        }
        (total.saturating_sub(downtime)) as f64 * 100.0 / total as f64
    }

    fn view(&self, now: u64) -> NodeHealthView {
        NodeHealthView {
            url: self.url.clone(),
            id: self.node_id.clone(),
            alive: self.alive,
            first_seen: self.first_seen,
            last_heartbeat: self.last_heartbeat,
            total_heartbeats: self.total_heartbeats,
            uptime_percent: self.uptime_percent(now),
            total_chunks: self.total_chunks,
            storage_used_mb: self.storage_used_mb,
            free_space_mb: self.free_space_mb,
            can_write: self.can_write,
        }
    }
}

/// How often a node earns a `verify_chunks` advisory command.
const VERIFY_EVERY_N_HEARTBEATS: u64 = 100;

pub struct LivenessTracker {
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeHealth>>>>,
    events: EventBus,
    heartbeat_timeout: Duration,
}

impl LivenessTracker {
    pub fn new(heartbeat_timeout: Duration, events: EventBus) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            events,
            heartbeat_timeout,
        }
    }

    /// Process one heartbeat.
    ///
    /// `SHUTDOWN` marks the node dead immediately without scheduling any
    /// repair; the periodic loop picks the slack up if the node never
    /// returns. `UP` upserts the record, diffs the reported inventory
    /// against the previous one, and publishes `NodeRecovered` /
    /// `InventoryChanged` as warranted.
    pub fn process_heartbeat(&self, hb: Heartbeat) -> Result<HeartbeatAck> {
        if hb.status == NodeStatus::Shutdown {
            if let Some(record) = self.record(&hb.url) {
                record.lock().unwrap().mark_dead(timestamp_now_millis());
            }
            tracing::info!(url = %hb.url, id = %hb.id, "Node announced shutdown");
            return Ok(HeartbeatAck {
                status: "success",
                message: "Shutdown acknowledged",
                timestamp: timestamp_now_millis(),
                commands: None,
            });
        }

        let record = self.record_or_insert(&hb.url, &hb.id);
        let mut node = record.lock().unwrap();

        let was_down = !node.alive;

        node.last_heartbeat = hb.timestamp;
        node.total_heartbeats += 1;
        if was_down {
            node.alive = true;
            if node.downtime_start > 0 {
                node.total_downtime_ms += hb.timestamp.saturating_sub(node.downtime_start);
                node.downtime_start = 0;
            }
            tracing::info!(
                url = %node.url,
                uptime = %format!("{:.1}%", node.uptime_percent(timestamp_now_millis())),
                "Node recovered"
            );
        }

        node.total_chunks = hb.total_chunks.or(node.total_chunks);
        node.storage_used_mb = hb.storage_used_mb.or(node.storage_used_mb);
        node.free_space_mb = hb.free_space_mb.or(node.free_space_mb);
        node.can_write = hb.can_write.or(node.can_write);

        if let Some(inventory) = &hb.inventory {
            if let Some(previous) = &node.last_inventory {
                let (removed, added) = inventory_diff(previous, inventory);
                if added > 0 {
                    tracing::debug!(url = %node.url, added, "Node inventory grew");
                }
                if !removed.is_empty() {
                    tracing::warn!(
                        url = %node.url,
                        removed = removed.len(),
                        "Chunks disappeared from node inventory"
                    );
                    self.events.publish(ClusterEvent::InventoryChanged {
                        url: node.url.clone(),
                        removed,
                    });
                }
            }
            node.last_inventory = Some(inventory.clone());
        }

        if was_down {
            self.events.publish(ClusterEvent::NodeRecovered {
                url: node.url.clone(),
                inventory: hb.inventory.clone(),
            });
        }

        let commands = (node.total_heartbeats % VERIFY_EVERY_N_HEARTBEATS == 0).then(|| {
            vec![NodeCommand {
                action: "verify_chunks".to_string(),
            }]
        });

        Ok(HeartbeatAck {
            status: "success",
            message: "Heartbeat received",
            timestamp: timestamp_now_millis(),
            commands,
        })
    }

    /// Mark every alive node past the heartbeat timeout dead and publish
    /// `NodeDown` for each. Returns the urls that timed out.
    pub fn sweep_timeouts(&self, now: u64) -> Vec<String> {
        let timeout_ms = self.heartbeat_timeout.as_millis() as u64;
        let mut timed_out = Vec::new();

        for record in self.snapshot_records() {
            let mut node = record.lock().unwrap();
            if node.alive && now.saturating_sub(node.last_heartbeat) > timeout_ms {
                node.mark_dead(now);
                tracing::warn!(
                    url = %node.url,
                    silent_for_secs = now.saturating_sub(node.last_heartbeat) / 1000,
                    uptime = %format!("{:.1}%", node.uptime_percent(now)),
                    "Node heartbeat timeout, marking dead"
                );
                timed_out.push(node.url.clone());
                self.events
                    .publish(ClusterEvent::NodeDown { url: node.url.clone() });
            }
        }

        timed_out
    }

    /// Run the timeout sweep on an interval until shutdown.
    pub fn spawn_timeout_checker(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::info!(
                interval_secs = interval.as_secs(),
                timeout_secs = self.heartbeat_timeout.as_secs(),
                "Heartbeat timeout checker starting"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_timeouts(timestamp_now_millis());
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Heartbeat timeout checker shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn is_alive(&self, url: &str) -> bool {
        self.record(url)
            .map(|r| r.lock().unwrap().alive)
            .unwrap_or(false)
    }

    pub fn alive_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .snapshot_records()
            .into_iter()
            .filter_map(|r| {
                let node = r.lock().unwrap();
                node.alive.then(|| node.url.clone())
            })
            .collect();
        urls.sort();
        urls
    }

    pub fn dead_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .snapshot_records()
            .into_iter()
            .filter_map(|r| {
                let node = r.lock().unwrap();
                (!node.alive).then(|| node.url.clone())
            })
            .collect();
        urls.sort();
        urls
    }

    /// Last inventory the node reported, if any.
    pub fn last_inventory(&self, url: &str) -> Option<Inventory> {
        self.record(url)
            .and_then(|r| r.lock().unwrap().last_inventory.clone())
    }

    /// Detailed per-node views for the status endpoints.
    pub fn node_views(&self) -> Vec<NodeHealthView> {
        let now = timestamp_now_millis();
        let mut views: Vec<NodeHealthView> = self
            .snapshot_records()
            .into_iter()
            .map(|r| r.lock().unwrap().view(now))
            .collect();
        views.sort_by(|a, b| a.url.cmp(&b.url));
        views
    }

    fn record(&self, url: &str) -> Option<Arc<Mutex<NodeHealth>>> {
        self.nodes.read().unwrap().get(url).cloned()
    }

    fn record_or_insert(&self, url: &str, node_id: &str) -> Arc<Mutex<NodeHealth>> {
        if let Some(record) = self.record(url) {
            return record;
        }
        let mut nodes = self.nodes.write().unwrap();
        nodes
            .entry(url.to_string())
            .or_insert_with(|| {
                tracing::info!(url, id = node_id, "First heartbeat from node");
                Arc::new(Mutex::new(NodeHealth::new(
                    url.to_string(),
                    node_id.to_string(),
                    timestamp_now_millis(),
                )))
            })
            .clone()
    }

    fn snapshot_records(&self) -> Vec<Arc<Mutex<NodeHealth>>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }
}

/// Set-difference of two inventories: pairs that disappeared, and how many
/// appeared.
fn inventory_diff(previous: &Inventory, current: &Inventory) -> (Vec<ChunkRef>, usize) {
    let mut removed = Vec::new();
    let mut added = 0;

    for (file_id, old_indices) in previous {
        let new_indices: HashSet<u32> = current
            .get(file_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        for &chunk_index in old_indices {
            if !new_indices.contains(&chunk_index) {
                removed.push(ChunkRef {
                    file_id: file_id.clone(),
                    chunk_index,
                });
            }
        }
    }

    for (file_id, new_indices) in current {
        let old_indices: HashSet<u32> = previous
            .get(file_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        added += new_indices
            .iter()
            .filter(|i| !old_indices.contains(i))
            .count();
    }

    removed.sort_by(|a, b| (&a.file_id, a.chunk_index).cmp(&(&b.file_id, b.chunk_index)));
    (removed, added)
}
