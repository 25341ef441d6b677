//! Coordinator binary

use chunkmesh::{Coordinator, CoordinatorConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chunkmesh-coord")]
#[command(about = "chunkmesh coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator server
    Serve {
        /// Config file (JSON); CLI flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for the HTTP API
        #[arg(long)]
        bind: Option<String>,

        /// Metadata snapshot directory
        #[arg(long)]
        metadata_dir: Option<PathBuf>,

        /// Target replicas per chunk
        #[arg(long)]
        replication_factor: Option<usize>,

        /// Heartbeat timeout in seconds
        #[arg(long)]
        heartbeat_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            metadata_dir,
            replication_factor,
            heartbeat_timeout,
        } => {
            let mut config = match config {
                Some(path) => CoordinatorConfig::from_file(path)?,
                None => CoordinatorConfig::default(),
            };
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }
            if let Some(dir) = metadata_dir {
                config.metadata_dir = dir;
            }
            if let Some(factor) = replication_factor {
                config.replication_factor = factor;
            }
            if let Some(timeout) = heartbeat_timeout {
                config.heartbeat_timeout_secs = timeout;
            }

            Coordinator::new(config).serve().await?;
        }
    }

    Ok(())
}
