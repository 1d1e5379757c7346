//! Blockline Core - block storage node: packet codec, block store, chained
//! replica write pipeline, reads, heartbeats and re-replication

pub mod block;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod pipeline;
pub mod protocol;
pub mod replication;
pub mod storage;

pub use block::{BlockId, BlockInfo, ReplicaList};
pub use error::{BlockError, Result};
pub use heartbeat::{
    Command, CoordinatorClient, HeartbeatClient, HeartbeatEnvelope, HeartbeatOptions,
    HeartbeatOutbox, HeartbeatRequest, HeartbeatResponse, HttpCoordinatorClient,
};
pub use node::{DEFAULT_MAX_TRANSFERS, DataNode};
pub use pipeline::{
    BlockWriter, DownstreamForwarder, ForwardOutcome, PipelineOptions, ReadHandler, ReadOutcome,
    WritePipelineHandler, WriteRequest, WriteStage, read_block, write_block,
};
pub use protocol::{MAX_PACKET_PAYLOAD, MAX_REPLICAS, OpHeader, Packet, Status};
pub use replication::{ReplicationCommand, ReplicationQueue, ReplicationWorker};
pub use storage::{
    BlockListener, BlockStore, ChunkLayout, CommittedBlock, DiskUsage, FinishedBlock, PendingBlock,
};
