use blockline_core::{BlockInfo, DiskUsage};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: String,
    pub(crate) node_address: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct BlocksResponse {
    pub(crate) node_address: String,
    pub(crate) blocks: Vec<BlockInfo>,
    pub(crate) pending_blocks: usize,
    pub(crate) usage: DiskUsage,
}
