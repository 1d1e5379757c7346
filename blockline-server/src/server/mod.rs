use crate::config::Config;
use axum::{Router, routing::get};
use blockline_core::{
    BlockError, BlockStore, CoordinatorClient, DataNode, HeartbeatClient, HttpCoordinatorClient,
    ReplicationQueue, ReplicationWorker, Result,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

mod internal;
mod types;

use internal::{health, internal_blocks};
pub(crate) use types::*;

pub struct ServerState {
    pub(crate) node_address: String,
    pub(crate) store: Arc<BlockStore>,
}

/// Creates the data directory layout and format marker.
pub fn init_data_dir(config: &Config) -> Result<()> {
    let store = BlockStore::open(config.node.data_dir.clone(), config.storage.checksums)?;
    let layout = store.layout();
    tracing::info!(
        "Initialized data directory {} (chunk size {}, checksums {})",
        config.node.data_dir.display(),
        layout.chunk_size,
        layout.checksums
    );
    Ok(())
}

pub async fn run_server(config: Config) -> Result<()> {
    let node_address = config.advertise_addr().to_string();
    let pipeline = config.pipeline_options();

    let store = Arc::new(BlockStore::open(
        config.node.data_dir.clone(),
        config.storage.checksums,
    )?);
    let usage = store.usage().await;
    tracing::info!(
        "Node {} serving {} blocks ({} bytes) from {}",
        node_address,
        usage.block_count,
        usage.used,
        config.node.data_dir.display()
    );

    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(HttpCoordinatorClient::new(
        &config.coordinator.url,
        pipeline.connect_timeout,
    )?);
    let replication = ReplicationQueue::new();
    let heartbeat = Arc::new(HeartbeatClient::new(
        node_address.clone(),
        store.clone(),
        coordinator,
        replication.clone(),
        config.heartbeat_options(),
    ));

    let data_listener = TcpListener::bind(&config.node.listen_addr).await?;
    let http_listener = TcpListener::bind(&config.node.http_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));
    let replication_task = tokio::spawn(
        ReplicationWorker::new(store.clone(), replication, pipeline).run(shutdown_rx.clone()),
    );
    let data_node = Arc::new(DataNode::new(
        store.clone(),
        node_address.clone(),
        pipeline,
        config.node.max_transfers,
    ));
    let data_task = tokio::spawn(data_node.serve(data_listener, shutdown_rx.clone()));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(error) => tracing::warn!("Failed to listen for ctrl-c: {}", error),
        }
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(ServerState {
        node_address,
        store,
    });
    let app = Router::new()
        .route("/health", get(health))
        .route("/internal/v1/blocks", get(internal_blocks))
        .with_state(state);

    tracing::info!("Internal HTTP listening on {}", config.node.http_addr);
    let mut http_shutdown = shutdown_rx;
    axum::serve(http_listener, app)
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
        .map_err(|error| BlockError::Http(error.to_string()))?;

    let served = data_task
        .await
        .map_err(|error| BlockError::Internal(error.to_string()))?;
    let _ = heartbeat_task.await;
    let _ = replication_task.await;
    served
}
