//! Heartbeat exchange with the coordinator
//!
//! The node reports status and block events; the coordinator answers with
//! maintenance commands. The coordinator transport sits behind the
//! [`CoordinatorClient`] trait.

pub mod client;
pub mod http;

use crate::block::{BlockId, BlockInfo, ReplicaList};
use crate::error::Result;
use crate::storage::DiskUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use client::{HeartbeatClient, HeartbeatOptions, HeartbeatOutbox};
pub use http::HttpCoordinatorClient;

/// Node-to-coordinator message. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartbeatEnvelope {
    Status {
        usage: DiskUsage,
        pending_blocks: usize,
        sent_at: DateTime<Utc>,
    },
    NewBlock {
        block: BlockInfo,
    },
    BlockDeleted {
        block_id: BlockId,
    },
    BlockReport {
        blocks: Vec<BlockInfo>,
        usage: DiskUsage,
    },
}

/// Coordinator-to-node instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ReportBlocks,
    DeleteBlocks {
        block_ids: Vec<BlockId>,
    },
    ReplicateBlock {
        block_id: BlockId,
        targets: ReplicaList,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_address: String,
    pub envelopes: Vec<HeartbeatEnvelope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Transport to the coordinator
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Delivers `envelopes` and returns the commands issued in reply.
    async fn heartbeat(
        &self,
        node_address: &str,
        envelopes: &[HeartbeatEnvelope],
    ) -> Result<Vec<Command>>;
}
