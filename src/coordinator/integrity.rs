//! Integrity reconciliation
//!
//! Storage node disks can lose chunks out-of-band: an operator deletes a
//! file, a disk is replaced, a node comes back from a crash with partial
//! data. The reconciler consumes cluster events and restores individual
//! missing replicas by copying from a verified peer.
//!
//! Three event sources feed the same repair path: inventory diffs from
//! heartbeats, node recovery, and node (re-)registration. The last one
//! catches tampering that happened while the coordinator itself was down.

use crate::common::{format_bytes, Error, Result};
use crate::coordinator::events::{ChunkRef, ClusterEvent, Inventory};
use crate::coordinator::liveness::LivenessTracker;
use crate::coordinator::metadata::{ChunkReplica, MetadataStore};
use crate::coordinator::node_client::NodeClient;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityStats {
    pub total_missing_chunks_detected: u64,
    pub total_chunks_repaired: u64,
    pub total_repair_attempts: u64,
    pub total_repair_failures: u64,
    pub currently_repairing: usize,
    pub success_rate: f64,
}

pub struct IntegrityReconciler {
    store: Arc<MetadataStore>,
    liveness: Arc<LivenessTracker>,
    client: NodeClient,
    /// Repairs in flight, keyed by (file, chunk, target)
    in_flight: Mutex<HashSet<String>>,
    missing_detected: AtomicU64,
    repaired: AtomicU64,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl IntegrityReconciler {
    pub fn new(
        store: Arc<MetadataStore>,
        liveness: Arc<LivenessTracker>,
        client: NodeClient,
    ) -> Self {
        Self {
            store,
            liveness,
            client,
            in_flight: Mutex::new(HashSet::new()),
            missing_detected: AtomicU64::new(0),
            repaired: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Consume the event queue until it closes or shutdown is signalled.
    pub fn spawn(
        self: Arc<Self>,
        mut events: UnboundedReceiver<ClusterEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Integrity reconciler starting");
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => self.handle_event(event).await,
                            None => break,
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Integrity reconciler shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub async fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::InventoryChanged { url, removed } => {
                tracing::warn!(
                    url = %url,
                    removed = removed.len(),
                    "Chunks deleted from a node out-of-band"
                );
                self.missing_detected
                    .fetch_add(removed.len() as u64, Ordering::Relaxed);
                for chunk in removed {
                    if let Err(e) = self
                        .repair_chunk(&chunk.file_id, chunk.chunk_index, &url)
                        .await
                    {
                        tracing::warn!(
                            file_id = %chunk.file_id,
                            chunk_index = chunk.chunk_index,
                            target = %url,
                            error = %e,
                            "Chunk repair failed"
                        );
                    }
                }
            }
            ClusterEvent::NodeRecovered { url, inventory } => match inventory {
                Some(inventory) => self.audit_node(&url, &inventory).await,
                None => {
                    tracing::debug!(url = %url, "Recovered node reported no inventory, skipping audit")
                }
            },
            ClusterEvent::NodeRegistered { url } => {
                // a returning node may have lost chunks while we were down
                match self.liveness.last_inventory(&url) {
                    Some(inventory) => self.audit_node(&url, &inventory).await,
                    None => {
                        tracing::debug!(url = %url, "Registered node has not heartbeated yet, skipping audit")
                    }
                }
            }
            ClusterEvent::NodeDown { url } => {
                tracing::info!(
                    url = %url,
                    "Node down; re-replication loop will restore redundancy if it stays down"
                );
            }
        }
    }

    /// Compare what a node should hold against what it reports, and repair
    /// every missing replica.
    pub async fn audit_node(&self, url: &str, inventory: &Inventory) {
        let expected = self.store.expected_for_node(url);
        if expected.is_empty() {
            tracing::debug!(url, "No chunks expected on node");
            return;
        }

        let mut missing: Vec<ChunkRef> = Vec::new();
        for (file_id, indices) in &expected {
            let reported: HashSet<u32> = inventory
                .get(file_id)
                .map(|v| v.iter().copied().collect())
                .unwrap_or_default();
            for &chunk_index in indices {
                if !reported.contains(&chunk_index) {
                    missing.push(ChunkRef {
                        file_id: file_id.clone(),
                        chunk_index,
                    });
                }
            }
        }

        if missing.is_empty() {
            tracing::info!(url, "Audit clean: node holds every expected chunk");
            return;
        }

        tracing::warn!(url, missing = missing.len(), "Audit found missing chunks");
        self.missing_detected
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        for chunk in missing {
            if let Err(e) = self
                .repair_chunk(&chunk.file_id, chunk.chunk_index, url)
                .await
            {
                tracing::warn!(
                    file_id = %chunk.file_id,
                    chunk_index = chunk.chunk_index,
                    target = url,
                    error = %e,
                    "Audit repair failed"
                );
            }
        }
    }

    /// Restore one replica on `target_url` by copying from a live peer
    /// that verifiably still holds the chunk.
    pub async fn repair_chunk(
        &self,
        file_id: &str,
        chunk_index: u32,
        target_url: &str,
    ) -> Result<()> {
        let key = format!("{}:{}:{}", file_id, chunk_index, target_url);
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            tracing::debug!(key = %key, "Repair already in flight");
            return Ok(());
        }
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let result = self.do_repair(file_id, chunk_index, target_url).await;
        self.in_flight.lock().unwrap().remove(&key);

        match &result {
            Ok(()) => {
                self.repaired.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn do_repair(&self, file_id: &str, chunk_index: u32, target_url: &str) -> Result<()> {
        let file = self.store.get(file_id)?;
        let replicas: Vec<ChunkReplica> = file.replicas_for(chunk_index).cloned().collect();
        if replicas.is_empty() {
            return Err(Error::Internal(format!(
                "no replicas registered for chunk {} of {}",
                chunk_index, file_id
            )));
        }

        let alive: HashSet<String> = self.liveness.alive_urls().into_iter().collect();

        // candidate sources: alive, not the target, and actually holding
        // the chunk (metadata can be stale about that too)
        let mut source = None;
        for replica in &replicas {
            if replica.node_url == target_url || !alive.contains(&replica.node_url) {
                continue;
            }
            if self
                .client
                .chunk_exists(&replica.node_url, file_id, chunk_index)
                .await
            {
                source = Some(replica.clone());
                break;
            }
        }
        let Some(source) = source else {
            return Err(Error::DataUnavailable {
                file_id: file_id.to_string(),
                chunk_index,
            });
        };

        let payload = self
            .client
            .read_chunk(&source.node_url, file_id, chunk_index)
            .await?;
        self.client
            .write_chunk(target_url, file_id, chunk_index, &payload.data)
            .await?;

        tracing::info!(
            file_id,
            chunk_index,
            source = %source.node_url,
            target = target_url,
            size = %format_bytes(payload.bytes as u64),
            "Chunk repaired"
        );

        let already_listed = replicas.iter().any(|r| r.node_url == target_url);
        if !already_listed {
            let next_ordinal = replicas
                .iter()
                .map(|r| r.replica_ordinal)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);
            let target = target_url.to_string();
            self.store.update_chunks(file_id, |f| {
                let duplicate = f
                    .chunks
                    .iter()
                    .any(|c| c.chunk_index == chunk_index && c.node_url == target);
                if !duplicate {
                    f.chunks.push(ChunkReplica {
                        chunk_index,
                        node_url: target,
                        replica_ordinal: next_ordinal,
                    });
                }
            })?;
        }

        Ok(())
    }

    pub fn stats(&self) -> IntegrityStats {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let repaired = self.repaired.load(Ordering::Relaxed);
        IntegrityStats {
            total_missing_chunks_detected: self.missing_detected.load(Ordering::Relaxed),
            total_chunks_repaired: repaired,
            total_repair_attempts: attempts,
            total_repair_failures: self.failures.load(Ordering::Relaxed),
            currently_repairing: self.in_flight.lock().unwrap().len(),
            success_rate: if attempts > 0 {
                repaired as f64 * 100.0 / attempts as f64
            } else {
                100.0
            },
        }
    }
}
