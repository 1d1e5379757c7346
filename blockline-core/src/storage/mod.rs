//! Storage modules for blockline
//!
//! Provides the per-node block store and its on-disk chunk layout.

pub mod block_store;
pub mod layout;

pub use block_store::{
    BlockListener, BlockStore, CommittedBlock, DiskUsage, FinishedBlock, PendingBlock,
};
pub use layout::ChunkLayout;
