//! Configuration for the chunkmesh coordinator

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration
///
/// All timing knobs are stored in seconds so the config file stays
/// human-editable; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory holding the metadata snapshot
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,

    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Target replicas per chunk
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Minimum replicas a degraded placement may produce
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Trim never reduces a chunk's live replica count below this
    #[serde(default = "default_trim_floor")]
    pub trim_floor: usize,

    /// Re-replication scan interval
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Max files in active repair at once
    #[serde(default = "default_max_concurrent_repairs")]
    pub max_concurrent_repairs: usize,

    /// Quiet window after a repair during which trim is suppressed
    #[serde(default = "default_cooldown_after_repair")]
    pub cooldown_after_repair_secs: u64,

    /// A node with no heartbeat for this long is marked dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Heartbeat timeout sweep interval
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Connect timeout for outbound node calls
    #[serde(default = "default_node_connect_timeout")]
    pub node_connect_timeout_secs: u64,

    /// Read timeout for outbound node calls (chunk copies can be slow)
    #[serde(default = "default_node_read_timeout")]
    pub node_read_timeout_secs: u64,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:5000".parse().unwrap()
}
fn default_metadata_dir() -> PathBuf {
    PathBuf::from("./metadata")
}
fn default_chunk_size() -> u64 {
    32 * 1024
}
fn default_replication_factor() -> usize {
    3
}
fn default_min_replicas() -> usize {
    1
}
fn default_trim_floor() -> usize {
    2
}
fn default_check_interval() -> u64 {
    30
}
fn default_max_concurrent_repairs() -> usize {
    2
}
fn default_cooldown_after_repair() -> u64 {
    60
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_cleanup_interval() -> u64 {
    10
}
fn default_node_connect_timeout() -> u64 {
    5
}
fn default_node_read_timeout() -> u64 {
    15
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            metadata_dir: default_metadata_dir(),
            chunk_size: default_chunk_size(),
            replication_factor: default_replication_factor(),
            min_replicas: default_min_replicas(),
            trim_floor: default_trim_floor(),
            check_interval_secs: default_check_interval(),
            max_concurrent_repairs: default_max_concurrent_repairs(),
            cooldown_after_repair_secs: default_cooldown_after_repair(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            node_connect_timeout_secs: default_node_connect_timeout(),
            node_read_timeout_secs: default_node_read_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cooldown_after_repair(&self) -> Duration {
        Duration::from_secs(self.cooldown_after_repair_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn node_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.node_connect_timeout_secs)
    }

    pub fn node_read_timeout(&self) -> Duration {
        Duration::from_secs(self.node_read_timeout_secs)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoordinatorConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_size == 0 {
            return Err(crate::Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.replication_factor == 0 {
            return Err(crate::Error::InvalidConfig(
                "replication_factor must be >= 1".into(),
            ));
        }
        if self.min_replicas == 0 || self.min_replicas > self.replication_factor {
            return Err(crate::Error::InvalidConfig(
                "min_replicas must be between 1 and replication_factor".into(),
            ));
        }
        if self.trim_floor == 0 || self.trim_floor > self.replication_factor {
            return Err(crate::Error::InvalidConfig(
                "trim_floor must be between 1 and replication_factor".into(),
            ));
        }
        if self.max_concurrent_repairs == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_concurrent_repairs must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec_constants() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.chunk_size, 32 * 1024);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.min_replicas, 1);
        assert_eq!(config.trim_floor, 2);
        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.max_concurrent_repairs, 2);
        assert_eq!(config.cooldown_after_repair_secs, 60);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.cleanup_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"bind_addr": "127.0.0.1:9000"}"#).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.metadata_dir, PathBuf::from("./metadata"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CoordinatorConfig::default();
        config.replication_factor = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.trim_floor = 4;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.min_replicas = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.json");

        let mut config = CoordinatorConfig::default();
        config.replication_factor = 5;
        config.to_file(&path).unwrap();

        let loaded = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.replication_factor, 5);
        assert_eq!(loaded.chunk_size, config.chunk_size);
    }
}
