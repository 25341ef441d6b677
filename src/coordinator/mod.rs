//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - Metadata management (file → chunk replica mapping, persisted)
//! - Node liveness (push heartbeats, timeout detection)
//! - Placement decisions for writes, liveness filtering for reads
//! - Re-replication of degraded files and trimming of surplus replicas
//! - Integrity reconciliation when nodes lose chunks out-of-band

pub mod events;
pub mod http;
pub mod integrity;
pub mod liveness;
pub mod metadata;
pub mod node_client;
pub mod placement;
pub mod registry;
pub mod replication;
pub mod server;

pub use server::Coordinator;
