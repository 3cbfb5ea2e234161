//! Keystone Metadata Service
//!
//! Hosts the metadata store replica together with its snapshot lifecycle:
//! the reclamation loop, checkpoint serving on the leader and catch-up on
//! lagging followers.

mod cluster;
mod http;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use cluster::StaticCluster;
use keystone_common::MetaConfig;
use keystone_meta_store::{
    CheckpointSource, LockManager, LockedSecretManager, MetaStore, ReplicatedLog, S3SecretManager,
    SnapshotManager, SnapshotProvider, SnapshotReclaimer, StoreSecretManager, clear_staging,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "keystone-meta")]
#[command(about = "Keystone Metadata Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/keystone/meta.toml")]
    config: String,

    /// Node ID (overrides config)
    #[arg(long)]
    node_id: Option<String>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Layer the config file, `KEYSTONE__*` environment variables and flags
fn load_config(args: &Args) -> Result<MetaConfig> {
    let mut config: MetaConfig = config::Config::builder()
        .add_source(config::File::new(&args.config, config::FileFormat::Toml).required(false))
        .add_source(
            config::Environment::with_prefix("KEYSTONE")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("failed to load {}", args.config))?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(id) = &args.node_id {
        config.node.id.clone_from(id);
    }
    if let Some(dir) = &args.data_dir {
        config.node.data_dir.clone_from(dir);
    }
    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!("Starting Keystone Metadata Service");
    info!("Node ID: {}", config.node.id);
    info!("Data directory: {}", config.node.data_dir.display());

    let store = Arc::new(
        MetaStore::open(config.node.db_dir())
            .with_context(|| format!("failed to open store in {}", config.node.db_dir().display()))?,
    );
    // Packages and downloads never outlive the process that staged them
    clear_staging(&config.node.staging_root()).with_context(|| {
        format!(
            "failed to clear staging directory {}",
            config.node.staging_root().display()
        )
    })?;
    let locks = Arc::new(LockManager::new());
    let cluster = Arc::new(StaticCluster::from_config(&config, Arc::clone(&store)));
    let log: Arc<dyn ReplicatedLog> = cluster.clone();
    info!(
        "Role: {} (applied index {})",
        if log.is_leader() { "leader" } else { "follower" },
        store.applied_index()?
    );

    let snapshots = Arc::new(SnapshotManager::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&log),
        config.node.snapshot_root(),
    ));
    let reclaimer = Arc::new(SnapshotReclaimer::new(snapshots));
    let source = Arc::new(CheckpointSource::new(
        Arc::clone(&store),
        Arc::clone(&log),
        config.node.staging_root().join("serve"),
    ));
    let secrets: Arc<dyn S3SecretManager> = Arc::new(LockedSecretManager::new(
        StoreSecretManager::new(Arc::clone(&store)),
        Arc::clone(&locks),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![tokio::spawn(
        Arc::clone(&reclaimer).run(config.snapshot.reclaim_interval(), shutdown_rx.clone()),
    )];

    if !log.is_leader() {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let provider = Arc::new(SnapshotProvider::new(
            Arc::clone(&store),
            Arc::clone(&log),
            transport,
            config.provider.clone(),
            config.node.staging_root().join("download"),
        ));
        tasks.push(tokio::spawn(provider.run(shutdown_rx.clone())));

        let leader = log.leader_id();
        match leader.as_ref().and_then(|l| config.peer_address(l.as_str())) {
            Some(address) => {
                let client = reqwest::Client::builder()
                    .timeout(config.provider.poll_interval())
                    .build()
                    .context("failed to build HTTP client")?;
                tasks.push(tokio::spawn(cluster.poll_leader(
                    client,
                    address.to_string(),
                    config.provider.poll_interval(),
                    shutdown_rx.clone(),
                )));
            }
            None => warn!("No address configured for leader {:?}", leader),
        }
    }

    let app = http::router(http::AppState {
        log,
        source,
        secrets,
    });
    let listener = tokio::net::TcpListener::bind(config.http.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.http.listen))?;
    info!("HTTP server listening on {}", config.http.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    info!("Metadata Service shut down gracefully");
    Ok(())
}
