//! File metadata store
//!
//! Owns the in-memory file → chunk-replica map and its on-disk snapshot.
//! Every mutation rewrites the snapshot: serialize the whole map to a
//! sibling temp file, then rename over the primary, so the on-disk copy is
//! always a complete serialization of some past state of the store.
//!
//! Readers take the shared lock and get defensive copies; mutations take
//! the exclusive lock. Nothing in this module performs network I/O.

use crate::common::{timestamp_now_millis, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const METADATA_FILE: &str = "file_metadata.json";
const METADATA_TEMP_FILE: &str = "file_metadata.tmp.json";

/// One replica of one chunk on one node.
///
/// For a given `(file_id, chunk_index)` no two replicas share a `node_url`.
/// The ordinal only labels replicas; correctness never depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReplica {
    pub chunk_index: u32,
    pub node_url: String,
    pub replica_ordinal: u32,
}

/// Metadata for one stored file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub size: u64,
    pub timestamp: u64,
    pub chunks: Vec<ChunkReplica>,
}

impl FileMetadata {
    pub fn new(file_id: impl Into<String>, size: u64) -> Self {
        Self {
            file_id: file_id.into(),
            size,
            timestamp: timestamp_now_millis(),
            chunks: Vec::new(),
        }
    }

    /// Number of chunks the file splits into: ceil(size / chunk_size)
    pub fn num_chunks(&self, chunk_size: u64) -> u32 {
        ((self.size + chunk_size - 1) / chunk_size) as u32
    }

    /// Replicas of a single chunk
    pub fn replicas_for(&self, chunk_index: u32) -> impl Iterator<Item = &ChunkReplica> {
        self.chunks
            .iter()
            .filter(move |c| c.chunk_index == chunk_index)
    }

    /// Replicas grouped by chunk index, ordered
    pub fn chunks_by_index(&self) -> BTreeMap<u32, Vec<&ChunkReplica>> {
        let mut grouped: BTreeMap<u32, Vec<&ChunkReplica>> = BTreeMap::new();
        for chunk in &self.chunks {
            grouped.entry(chunk.chunk_index).or_default().push(chunk);
        }
        grouped
    }
}

/// Metadata store
pub struct MetadataStore {
    files: RwLock<HashMap<String, FileMetadata>>,
    snapshot_path: PathBuf,
    temp_path: PathBuf,
    persist_errors: AtomicU64,
}

impl MetadataStore {
    /// Open the store, loading the snapshot if one exists.
    ///
    /// A missing snapshot starts the store empty. An unreadable snapshot
    /// (I/O error) also starts empty, with an error log for the operator.
    /// A snapshot that reads but does not parse is fatal: overwriting it
    /// would destroy the operator's only copy.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(METADATA_FILE);
        let temp_path = dir.join(METADATA_TEMP_FILE);

        let files = if snapshot_path.exists() {
            match fs::read_to_string(&snapshot_path) {
                Ok(raw) => serde_json::from_str::<HashMap<String, FileMetadata>>(&raw)
                    .map_err(|e| {
                        Error::Corrupted(format!("{}: {}", snapshot_path.display(), e))
                    })?,
                Err(e) => {
                    tracing::error!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "Failed to read metadata snapshot, starting empty"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        tracing::info!(
            path = %snapshot_path.display(),
            files = files.len(),
            "Metadata store loaded"
        );

        Ok(Self {
            files: RwLock::new(files),
            snapshot_path,
            temp_path,
            persist_errors: AtomicU64::new(0),
        })
    }

    /// Insert or replace a file, then persist.
    pub fn put(&self, file: FileMetadata) {
        let mut files = self.files.write().unwrap();
        files.insert(file.file_id.clone(), file);
        self.persist(&files);
    }

    /// Get a copy of a file's metadata.
    pub fn get(&self, file_id: &str) -> Result<FileMetadata> {
        self.files
            .read()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(file_id.to_string()))
    }

    /// Snapshot of all files.
    pub fn list(&self) -> Vec<FileMetadata> {
        self.files.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a file and persist. Returns false if the file was absent.
    pub fn delete(&self, file_id: &str) -> bool {
        let mut files = self.files.write().unwrap();
        if files.remove(file_id).is_some() {
            self.persist(&files);
            true
        } else {
            false
        }
    }

    /// Apply a mutation to one file under the write lock, then persist.
    /// Returns a copy of the mutated file.
    pub fn update_chunks<F>(&self, file_id: &str, mutate: F) -> Result<FileMetadata>
    where
        F: FnOnce(&mut FileMetadata),
    {
        let mut files = self.files.write().unwrap();
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(file_id.to_string()))?;
        mutate(file);
        let updated = file.clone();
        self.persist(&files);
        Ok(updated)
    }

    /// Every `(file_id, chunk_index)` the given node is expected to hold.
    pub fn expected_for_node(&self, node_url: &str) -> HashMap<String, BTreeSet<u32>> {
        let files = self.files.read().unwrap();
        let mut expected: HashMap<String, BTreeSet<u32>> = HashMap::new();
        for file in files.values() {
            for chunk in &file.chunks {
                if chunk.node_url == node_url {
                    expected
                        .entry(file.file_id.clone())
                        .or_default()
                        .insert(chunk.chunk_index);
                }
            }
        }
        expected
    }

    /// Number of snapshot writes that have failed since startup.
    pub fn persist_errors(&self) -> u64 {
        self.persist_errors.load(Ordering::Relaxed)
    }

    /// Has every snapshot write so far landed on disk?
    pub fn is_healthy(&self) -> bool {
        self.persist_errors() == 0
    }

    /// Write the snapshot: temp file, then atomic rename over the primary.
    ///
    /// A failed write is logged and counted; the in-memory state stands and
    /// the store stays available. `/health` reports the condition.
    fn persist(&self, files: &HashMap<String, FileMetadata>) {
        // BTreeMap gives the snapshot a stable key order
        let ordered: BTreeMap<&String, &FileMetadata> = files.iter().collect();

        let result = serde_json::to_string_pretty(&ordered)
            .map_err(|e| Error::Persistence(e.to_string()))
            .and_then(|raw| {
                fs::write(&self.temp_path, raw)?;
                fs::rename(&self.temp_path, &self.snapshot_path)?;
                Ok(())
            });

        if let Err(e) = result {
            self.persist_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                path = %self.snapshot_path.display(),
                error = %e,
                "Failed to persist metadata snapshot, in-memory state retained"
            );
            let _ = fs::remove_file(&self.temp_path);
        } else {
            tracing::debug!(files = files.len(), "Metadata snapshot persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn replica(chunk_index: u32, node_url: &str, ordinal: u32) -> ChunkReplica {
        ChunkReplica {
            chunk_index,
            node_url: node_url.to_string(),
            replica_ordinal: ordinal,
        }
    }

    #[test]
    fn test_num_chunks() {
        let mut file = FileMetadata::new("img1", 70_000);
        assert_eq!(file.num_chunks(32 * 1024), 3);
        file.size = 32 * 1024;
        assert_eq!(file.num_chunks(32 * 1024), 1);
        file.size = 0;
        assert_eq!(file.num_chunks(32 * 1024), 0);
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        let mut file = FileMetadata::new("img1", 1000);
        file.chunks.push(replica(0, "http://a:7001", 0));
        store.put(file);

        let loaded = store.get("img1").unwrap();
        assert_eq!(loaded.size, 1000);
        assert_eq!(loaded.chunks.len(), 1);

        assert!(store.delete("img1"));
        assert!(!store.delete("img1"));
        assert!(matches!(store.get("img1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let store = MetadataStore::open(dir.path()).unwrap();
            let mut file = FileMetadata::new("img1", 70_000);
            file.chunks.push(replica(0, "http://a:7001", 0));
            file.chunks.push(replica(0, "http://b:7001", 1));
            store.put(file);
        }

        let reopened = MetadataStore::open(dir.path()).unwrap();
        let loaded = reopened.get("img1").unwrap();
        assert_eq!(loaded.chunks.len(), 2);
        assert_eq!(loaded.size, 70_000);
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();

        assert!(matches!(
            MetadataStore::open(dir.path()),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.put(FileMetadata::new("img1", 10));

        assert!(dir.path().join(METADATA_FILE).exists());
        assert!(!dir.path().join(METADATA_TEMP_FILE).exists());
    }

    #[test]
    fn test_update_chunks() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.put(FileMetadata::new("img1", 1000));

        let updated = store
            .update_chunks("img1", |f| {
                f.chunks.push(replica(0, "http://a:7001", 0));
            })
            .unwrap();
        assert_eq!(updated.chunks.len(), 1);

        assert!(store.update_chunks("missing", |_| {}).is_err());
    }

    #[test]
    fn test_expected_for_node() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        let mut img1 = FileMetadata::new("img1", 70_000);
        img1.chunks.push(replica(0, "http://a:7001", 0));
        img1.chunks.push(replica(1, "http://a:7001", 0));
        img1.chunks.push(replica(1, "http://b:7001", 1));
        store.put(img1);

        let mut img2 = FileMetadata::new("img2", 1000);
        img2.chunks.push(replica(0, "http://a:7001", 0));
        store.put(img2);

        let expected = store.expected_for_node("http://a:7001");
        assert_eq!(expected.len(), 2);
        assert_eq!(
            expected["img1"].iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(expected["img2"].iter().copied().collect::<Vec<_>>(), vec![0]);

        assert!(store.expected_for_node("http://c:7001").is_empty());
    }
}
