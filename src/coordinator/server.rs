//! Coordinator server
//!
//! Wires the store, registry, tracker, planner and the background workers
//! together, serves the HTTP API, and tears the workers down with a
//! bounded grace period on shutdown.

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::events;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::integrity::IntegrityReconciler;
use crate::coordinator::liveness::LivenessTracker;
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::node_client::NodeClient;
use crate::coordinator::placement::PlacementPlanner;
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::replication::ReplicationMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long in-flight workers get to wind down after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;

        tracing::info!("Starting coordinator");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Metadata dir: {}", self.config.metadata_dir.display());
        tracing::info!(
            "  Replication: factor {}, trim floor {}",
            self.config.replication_factor,
            self.config.trim_floor
        );
        tracing::info!(
            "  Heartbeat timeout {}s, sweep every {}s",
            self.config.heartbeat_timeout_secs,
            self.config.cleanup_interval_secs
        );

        let config = Arc::new(self.config);

        // state owners
        let store = Arc::new(MetadataStore::open(&config.metadata_dir)?);
        let (events, events_rx) = events::channel();
        let liveness = Arc::new(LivenessTracker::new(
            config.heartbeat_timeout(),
            events.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new());
        let planner = Arc::new(PlacementPlanner::new(
            config.chunk_size,
            config.replication_factor,
            config.min_replicas,
        ));
        let client = NodeClient::new(config.node_connect_timeout(), config.node_read_timeout());

        // background workers
        let replication = Arc::new(ReplicationMonitor::new(
            store.clone(),
            liveness.clone(),
            client.clone(),
            config.clone(),
        ));
        let integrity = Arc::new(IntegrityReconciler::new(
            store.clone(),
            liveness.clone(),
            client.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = liveness
            .clone()
            .spawn_timeout_checker(config.cleanup_interval(), shutdown_tx.subscribe());
        let repair_loop = replication.clone().spawn(shutdown_tx.subscribe());
        let reconciler = integrity
            .clone()
            .spawn(events_rx, shutdown_tx.subscribe());

        let state = CoordState {
            config: config.clone(),
            store,
            registry,
            liveness,
            planner,
            replication,
            integrity,
            events,
            client,
        };
        let router = create_router(state);

        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!("✓ Coordinator ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // stop the workers; give in-flight repairs a bounded window
        let _ = shutdown_tx.send(());
        for (name, handle) in [
            ("timeout checker", sweeper),
            ("re-replication monitor", repair_loop),
            ("integrity reconciler", reconciler),
        ] {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!(worker = name, "Worker did not stop in time, abandoning");
            }
        }
        tracing::info!("Coordinator stopped");

        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
