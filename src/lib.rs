//! # chunkmesh
//!
//! Coordinator for a small replicated chunk object store. Immutable blobs
//! are split into fixed-size chunks, each chunk is stored on several
//! storage nodes, and this process tracks where every chunk lives:
//! - node liveness via push heartbeats with timeout detection
//! - replica placement for new writes, liveness-filtered placement for reads
//! - automatic re-replication when nodes die and trim when replicas pile up
//! - integrity repair when a node's disk loses chunks out-of-band
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                Coordinator                     │
//! │  metadata store ── placement ── liveness       │
//! │        │                            │ events   │
//! │  re-replication loop      integrity reconciler │
//! └───────┬───────────────────┬────────────────────┘
//!         │ HTTP (chunk read/write/delete/exists)
//!   ┌─────┴─────┐   ┌─────────┴─┐   ┌───────────┐
//!   │  Node 1   │   │  Node 2   │   │  Node 3   │
//!   │ (chunks)  │   │ (chunks)  │   │ (chunks)  │
//!   └───────────┘   └───────────┘   └───────────┘
//!         └──────── heartbeats ────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! chunkmesh-coord serve --bind 0.0.0.0:5000 --metadata-dir ./metadata
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
