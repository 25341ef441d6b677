//! Re-replication loop
//!
//! Scans every file on an interval and drives replica counts back to the
//! target factor: under-replicated chunks are repaired by copy-from-peer,
//! surplus replicas are trimmed. File-level repairs are mutually exclusive
//! and capped; trim is suppressed while a file sits in its post-repair
//! cooldown window so the two operations never fight each other.

use crate::common::{format_bytes, timestamp_now_millis, CoordinatorConfig, Result};
use crate::coordinator::liveness::LivenessTracker;
use crate::coordinator::metadata::{ChunkReplica, FileMetadata, MetadataStore};
use crate::coordinator::node_client::NodeClient;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Replication health of one file, counted over live replicas only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub total_chunks: usize,
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub total_replicas: usize,
    pub chunks_needing_repair: usize,
}

impl ReplicationStatus {
    pub fn needs_repair(&self) -> bool {
        self.chunks_needing_repair > 0
    }

    pub fn has_excess(&self, replication_factor: usize) -> bool {
        self.max_replicas > replication_factor + 1
    }
}

/// Count live replicas per chunk of a file.
pub fn analyze_replication(
    file: &FileMetadata,
    live: &HashSet<String>,
    replication_factor: usize,
) -> ReplicationStatus {
    let grouped = file.chunks_by_index();
    let mut min_replicas = usize::MAX;
    let mut max_replicas = 0;
    let mut total_replicas = 0;
    let mut chunks_needing_repair = 0;

    for replicas in grouped.values() {
        let alive = replicas
            .iter()
            .filter(|r| live.contains(&r.node_url))
            .count();
        min_replicas = min_replicas.min(alive);
        max_replicas = max_replicas.max(alive);
        total_replicas += alive;
        if alive < replication_factor {
            chunks_needing_repair += 1;
        }
    }

    ReplicationStatus {
        total_chunks: grouped.len(),
        min_replicas: if min_replicas == usize::MAX {
            0
        } else {
            min_replicas
        },
        max_replicas,
        total_replicas,
        chunks_needing_repair,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStats {
    pub files_in_repair: usize,
    pub repairing: Vec<String>,
    pub total_repair_attempts: u64,
    pub total_repairs_completed: u64,
    pub total_trim_operations: u64,
    pub total_replicas_created: u64,
    pub total_replicas_trimmed: u64,
}

pub struct ReplicationMonitor {
    store: Arc<MetadataStore>,
    liveness: Arc<LivenessTracker>,
    client: NodeClient,
    config: Arc<CoordinatorConfig>,
    /// Files with a repair or trim in flight
    in_flight: Mutex<HashSet<String>>,
    /// file id → unix-ms of last completed repair
    last_repair: Mutex<HashMap<String, u64>>,
    repair_attempts: AtomicU64,
    repairs_completed: AtomicU64,
    trim_operations: AtomicU64,
    replicas_created: AtomicU64,
    replicas_trimmed: AtomicU64,
}

impl ReplicationMonitor {
    pub fn new(
        store: Arc<MetadataStore>,
        liveness: Arc<LivenessTracker>,
        client: NodeClient,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            store,
            liveness,
            client,
            config,
            in_flight: Mutex::new(HashSet::new()),
            last_repair: Mutex::new(HashMap::new()),
            repair_attempts: AtomicU64::new(0),
            repairs_completed: AtomicU64::new(0),
            trim_operations: AtomicU64::new(0),
            replicas_created: AtomicU64::new(0),
            replicas_trimmed: AtomicU64::new(0),
        }
    }

    /// Run the loop until shutdown. In-flight repair tasks from the last
    /// tick are awaited briefly on the way out, then abandoned.
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval());
            // the immediate first tick would scan before any node heartbeats
            ticker.tick().await;

            tracing::info!(
                interval_secs = self.config.check_interval_secs,
                max_concurrent = self.config.max_concurrent_repairs,
                cooldown_secs = self.config.cooldown_after_repair_secs,
                "Re-replication monitor starting"
            );

            let mut tasks: Vec<JoinHandle<()>> = Vec::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tasks.retain(|t| !t.is_finished());
                        tasks.extend(Arc::clone(&self).tick().await);
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Re-replication monitor shutting down");
                        for task in tasks {
                            if tokio::time::timeout(std::time::Duration::from_secs(5), task)
                                .await
                                .is_err()
                            {
                                tracing::warn!("Abandoning in-flight repair at shutdown");
                            }
                        }
                        break;
                    }
                }
            }
        })
    }

    /// One scan pass. Returns handles of the repair/trim tasks it started.
    pub async fn tick(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let live = self.liveness.alive_urls();
        // a lone survivor cannot improve anything
        if live.len() < 2 {
            return Vec::new();
        }

        let replication_factor = self.config.replication_factor;
        let live_set: HashSet<String> = live.iter().cloned().collect();
        let now = timestamp_now_millis();

        let mut degraded: Vec<(FileMetadata, ReplicationStatus)> = Vec::new();
        let mut over_replicated: Vec<(FileMetadata, ReplicationStatus)> = Vec::new();

        for file in self.store.list() {
            let status = analyze_replication(&file, &live_set, replication_factor);
            if status.needs_repair() {
                degraded.push((file, status));
            } else if status.has_excess(replication_factor) && !self.in_cooldown(&file.file_id, now)
            {
                over_replicated.push((file, status));
            }
        }

        if degraded.is_empty() && over_replicated.is_empty() {
            tracing::debug!(alive = live.len(), "Replication optimal on all files");
            return Vec::new();
        }

        // worst-off files first
        degraded.sort_by_key(|(_, status)| status.min_replicas);

        let mut tasks = Vec::new();

        for (file, status) in degraded {
            if self.in_flight.lock().unwrap().len() >= self.config.max_concurrent_repairs {
                tracing::debug!("Concurrent repair limit reached");
                break;
            }
            if !self.reserve(&file.file_id) {
                continue;
            }
            self.repair_attempts.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                file_id = %file.file_id,
                min_replicas = status.min_replicas,
                chunks_needing_repair = status.chunks_needing_repair,
                "Starting file repair"
            );

            let monitor = Arc::clone(&self);
            let live = live.clone();
            tasks.push(tokio::spawn(async move {
                let file_id = file.file_id.clone();
                match monitor.repair_file(&file, &live).await {
                    Ok(created) => {
                        monitor.repairs_completed.fetch_add(1, Ordering::Relaxed);
                        monitor
                            .last_repair
                            .lock()
                            .unwrap()
                            .insert(file_id.clone(), timestamp_now_millis());
                        tracing::info!(file_id = %file_id, replicas_created = created, "File repair completed");
                    }
                    Err(e) => {
                        tracing::warn!(file_id = %file_id, error = %e, "File repair failed");
                    }
                }
                monitor.release(&file_id);
            }));
        }

        for (file, status) in over_replicated {
            if !self.reserve(&file.file_id) {
                continue;
            }
            tracing::info!(
                file_id = %file.file_id,
                max_replicas = status.max_replicas,
                "Starting replica trim"
            );

            let monitor = Arc::clone(&self);
            let live_set = live_set.clone();
            tasks.push(tokio::spawn(async move {
                let file_id = file.file_id.clone();
                match monitor.trim_file(&file, &live_set).await {
                    Ok(trimmed) if trimmed > 0 => {
                        monitor.trim_operations.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(file_id = %file_id, replicas_trimmed = trimmed, "Trim completed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(file_id = %file_id, error = %e, "Trim failed");
                    }
                }
                monitor.release(&file_id);
            }));
        }

        tasks
    }

    /// Bring every chunk of one file back to the replication factor.
    ///
    /// A source read failure falls through to the next live replica; a
    /// target write failure is logged and the remaining targets still get
    /// attempted. Metadata is persisted once at the end.
    async fn repair_file(&self, file: &FileMetadata, live: &[String]) -> Result<u64> {
        let replication_factor = self.config.replication_factor;
        let live_set: HashSet<&String> = live.iter().collect();
        let mut created: Vec<ChunkReplica> = Vec::new();

        for (chunk_index, replicas) in file.chunks_by_index() {
            let alive_replicas: Vec<&ChunkReplica> = replicas
                .iter()
                .copied()
                .filter(|r| live_set.contains(&r.node_url))
                .collect();

            let missing = replication_factor.saturating_sub(alive_replicas.len());
            if missing == 0 {
                continue;
            }
            if alive_replicas.is_empty() {
                tracing::warn!(
                    file_id = %file.file_id,
                    chunk_index,
                    "No live replica to copy from"
                );
                continue;
            }

            let holders: HashSet<&String> =
                alive_replicas.iter().map(|r| &r.node_url).collect();
            let targets: Vec<&String> = live
                .iter()
                .filter(|url| !holders.contains(url))
                .take(missing)
                .collect();
            if targets.is_empty() {
                tracing::warn!(
                    file_id = %file.file_id,
                    chunk_index,
                    "No free node to place a new replica on"
                );
                continue;
            }

            // first readable live replica wins as source
            let mut payload = None;
            for source in &alive_replicas {
                match self
                    .client
                    .read_chunk(&source.node_url, &file.file_id, chunk_index)
                    .await
                {
                    Ok(chunk) => {
                        payload = Some(chunk);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file_id = %file.file_id,
                            chunk_index,
                            source = %source.node_url,
                            error = %e,
                            "Source read failed, trying next replica"
                        );
                    }
                }
            }
            let Some(payload) = payload else {
                tracing::warn!(
                    file_id = %file.file_id,
                    chunk_index,
                    "Every live replica failed to serve the chunk"
                );
                continue;
            };

            let mut next_ordinal = replicas
                .iter()
                .map(|r| r.replica_ordinal)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);

            for target in targets {
                match self
                    .client
                    .write_chunk(target, &file.file_id, chunk_index, &payload.data)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(
                            file_id = %file.file_id,
                            chunk_index,
                            target,
                            size = %format_bytes(payload.bytes as u64),
                            "Replica created"
                        );
                        created.push(ChunkReplica {
                            chunk_index,
                            node_url: target.clone(),
                            replica_ordinal: next_ordinal,
                        });
                        next_ordinal += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file_id = %file.file_id,
                            chunk_index,
                            target,
                            error = %e,
                            "Replica write failed"
                        );
                    }
                }
            }
        }

        let count = created.len() as u64;
        if !created.is_empty() {
            self.replicas_created.fetch_add(count, Ordering::Relaxed);
            self.store.update_chunks(&file.file_id, |f| {
                for replica in created {
                    let duplicate = f
                        .chunks
                        .iter()
                        .any(|c| c.chunk_index == replica.chunk_index && c.node_url == replica.node_url);
                    if !duplicate {
                        f.chunks.push(replica);
                    }
                }
            })?;
        }
        Ok(count)
    }

    /// Delete surplus replicas down to the replication factor, keeping the
    /// lowest ordinals, never dipping to or below the trim floor.
    async fn trim_file(&self, file: &FileMetadata, live: &HashSet<String>) -> Result<u64> {
        let replication_factor = self.config.replication_factor;
        let mut removed: Vec<ChunkReplica> = Vec::new();

        for (chunk_index, replicas) in file.chunks_by_index() {
            let mut alive_replicas: Vec<ChunkReplica> = replicas
                .iter()
                .filter(|r| live.contains(&r.node_url))
                .map(|r| (*r).clone())
                .collect();
            alive_replicas.sort_by_key(|r| r.replica_ordinal);

            if alive_replicas.len() <= replication_factor
                || alive_replicas.len() <= self.config.trim_floor
            {
                continue;
            }

            let excess = alive_replicas.split_off(replication_factor);
            tracing::info!(
                file_id = %file.file_id,
                chunk_index,
                excess = excess.len(),
                "Trimming surplus replicas"
            );

            for replica in excess {
                match self
                    .client
                    .delete_chunk(&replica.node_url, &file.file_id, chunk_index)
                    .await
                {
                    Ok(()) => removed.push(replica),
                    Err(e) => {
                        tracing::warn!(
                            file_id = %file.file_id,
                            chunk_index,
                            node = %replica.node_url,
                            error = %e,
                            "Replica delete failed"
                        );
                    }
                }
            }
        }

        let count = removed.len() as u64;
        if !removed.is_empty() {
            self.replicas_trimmed.fetch_add(count, Ordering::Relaxed);
            self.store.update_chunks(&file.file_id, |f| {
                f.chunks.retain(|c| !removed.contains(c));
            })?;
        }
        Ok(count)
    }

    pub fn last_repair_time(&self, file_id: &str) -> Option<u64> {
        self.last_repair.lock().unwrap().get(file_id).copied()
    }

    pub fn stats(&self) -> ReplicationStats {
        let in_flight = self.in_flight.lock().unwrap();
        let mut repairing: Vec<String> = in_flight.iter().cloned().collect();
        repairing.sort();
        ReplicationStats {
            files_in_repair: in_flight.len(),
            repairing,
            total_repair_attempts: self.repair_attempts.load(Ordering::Relaxed),
            total_repairs_completed: self.repairs_completed.load(Ordering::Relaxed),
            total_trim_operations: self.trim_operations.load(Ordering::Relaxed),
            total_replicas_created: self.replicas_created.load(Ordering::Relaxed),
            total_replicas_trimmed: self.replicas_trimmed.load(Ordering::Relaxed),
        }
    }

    fn in_cooldown(&self, file_id: &str, now: u64) -> bool {
        let cooldown_ms = self.config.cooldown_after_repair().as_millis() as u64;
        self.last_repair
            .lock()
            .unwrap()
            .get(file_id)
            .is_some_and(|&t| now.saturating_sub(t) < cooldown_ms)
    }

    fn reserve(&self, file_id: &str) -> bool {
        self.in_flight.lock().unwrap().insert(file_id.to_string())
    }

    fn release(&self, file_id: &str) {
        self.in_flight.lock().unwrap().remove(file_id);
    }
}
