use super::{BlocksResponse, HealthResponse, ServerState};
use axum::{Json, extract::State};
use std::sync::Arc;

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_address: state.node_address.clone(),
    })
}

pub(crate) async fn internal_blocks(State(state): State<Arc<ServerState>>) -> Json<BlocksResponse> {
    Json(BlocksResponse {
        node_address: state.node_address.clone(),
        blocks: state.store.block_report().await,
        pending_blocks: state.store.pending_count().await,
        usage: state.store.usage().await,
    })
}
