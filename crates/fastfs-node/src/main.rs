mod handlers;
mod routes;
mod state;
mod sync_reader;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use fastfs_blockstore::{BlockStore, BlockStoreConfig};
use fastfs_config::Cli;
use fastfs_hashring::{SharedRing, DEFAULT_REPLICAS};
use fastfs_index::LocationIndex;
use fastfs_membership::{Membership, MembershipConfig};
use fastfs_objectstore::S3ObjectStore;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = fastfs_config::init(&cli).context("resolving configuration")?;
    fastfs_config::init_tracing(config.verbose);

    info!(bucket = %config.bucket, address = %config.address, port = config.port, "starting fastfsd");

    let objects = Arc::new(S3ObjectStore::from_env(&config.bucket).await);

    let block_size = config.block_size_kb * 1024;
    let arena_path = std::env::temp_dir().join("fastfs").join(format!("{}.arena", config.port));
    if let Some(parent) = arena_path.parent() {
        std::fs::create_dir_all(parent).context("creating arena directory")?;
    }
    let disk_slot_size = block_size as usize;
    let disk_num_slots = (config.disk_max / block_size).max(1) as u32;
    let mem_capacity_entries = (config.mem_max / block_size).max(1) as usize;
    let store = BlockStore::open(
        &arena_path,
        BlockStoreConfig {
            mem_capacity_entries,
            disk_slot_size,
            disk_num_slots,
        },
    )
    .context("opening block store arena")?;

    // `local_addr` is the HTTP-reachable address peers redirect to and
    // the ring/location index record as the owner of a cached block.
    let local_addr = format!("{}:{}", config.address, config.fsport);
    let gossip_bind: SocketAddr = format!("{}:{}", config.address, config.port)
        .parse()
        .context("parsing gossip bind address")?;

    let seeds = match (&config.primary_addr, config.primary_port) {
        (Some(addr), Some(port)) => vec![format!("{addr}:{port}")],
        _ => Vec::new(),
    };

    let membership = Membership::start(local_addr.clone(), gossip_bind, seeds, MembershipConfig::default())
        .await
        .context("starting membership gossip")?;

    let ring = SharedRing::spawn(membership.clone(), DEFAULT_REPLICAS).await;

    let index = LocationIndex::connect(&config.redis_addr)
        .await
        .context("connecting to location index")?;

    let app_state = AppState::new(
        store,
        objects,
        index,
        ring,
        membership,
        block_size,
        config.num_downloaders,
        local_addr,
    );

    let router = routes::build(app_state);

    let listen_addr: SocketAddr = format!("{}:{}", config.address, config.fsport)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;

    info!(addr = %listen_addr, "fastfsd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
