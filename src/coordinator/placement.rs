//! Replica placement
//!
//! Plans where new chunks go and filters placements by liveness for reads.
//! Write placement shuffles the alive node set uniformly per chunk, which
//! spreads load under churn better than the positional round-robin it
//! replaces.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{ChunkReplica, FileMetadata};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashSet;

pub struct PlacementPlanner {
    chunk_size: u64,
    replication_factor: usize,
    min_replicas: usize,
}

impl PlacementPlanner {
    pub fn new(chunk_size: u64, replication_factor: usize, min_replicas: usize) -> Self {
        Self {
            chunk_size,
            replication_factor,
            min_replicas,
        }
    }

    /// Plan placement for a new file of `size` bytes across `live` nodes.
    ///
    /// Each chunk gets `min(replication_factor, |live|)` distinct nodes,
    /// chosen by uniform random shuffle. Fewer live nodes than the target
    /// factor degrades the plan (logged) rather than failing it, down to
    /// `min_replicas`.
    pub fn plan_upload(&self, file_id: &str, size: u64, live: &[String]) -> Result<FileMetadata> {
        if live.is_empty() {
            return Err(Error::NoCapacity {
                available: 0,
                required: self.min_replicas,
            });
        }

        let target = self.replication_factor.min(live.len());
        if target < self.min_replicas {
            return Err(Error::NoCapacity {
                available: live.len(),
                required: self.min_replicas,
            });
        }
        if target < self.replication_factor {
            tracing::warn!(
                file_id,
                available = live.len(),
                target,
                replication_factor = self.replication_factor,
                "Degraded placement: fewer alive nodes than replication factor"
            );
        }

        let mut file = FileMetadata::new(file_id, size);
        let num_chunks = file.num_chunks(self.chunk_size);
        let mut rng = thread_rng();

        for chunk_index in 0..num_chunks {
            let mut candidates = live.to_vec();
            candidates.shuffle(&mut rng);
            for (ordinal, node_url) in candidates.into_iter().take(target).enumerate() {
                file.chunks.push(ChunkReplica {
                    chunk_index,
                    node_url,
                    replica_ordinal: ordinal as u32,
                });
            }
        }

        tracing::info!(
            file_id,
            size,
            num_chunks,
            replicas_per_chunk = target,
            "Upload planned"
        );

        Ok(file)
    }

    /// Restrict a file's placement to alive nodes.
    ///
    /// Fails with `DataUnavailable` if any chunk would lose its last
    /// replica; a successful result always serves every chunk.
    pub fn filter_for_read(
        &self,
        file: &FileMetadata,
        alive: &HashSet<String>,
    ) -> Result<FileMetadata> {
        let mut filtered = file.clone();
        filtered.chunks.retain(|c| alive.contains(&c.node_url));

        for chunk_index in 0..file.num_chunks(self.chunk_size) {
            if filtered.replicas_for(chunk_index).next().is_none() {
                return Err(Error::DataUnavailable {
                    file_id: file.file_id.clone(),
                    chunk_index,
                });
            }
        }

        let dropped = file.chunks.len() - filtered.chunks.len();
        if dropped > 0 {
            tracing::debug!(
                file_id = %file.file_id,
                dropped,
                remaining = filtered.chunks.len(),
                "Filtered replicas on dead nodes"
            );
        }

        Ok(filtered)
    }
}
