//! Block transfer pipeline: the server-side write and read handlers, the
//! downstream forwarder that chains replicas, and the client side used to
//! drive a chain.

pub mod client;
pub mod forwarder;
pub mod read;
pub mod write;

pub use client::{BlockWriter, read_block, write_block};
pub use forwarder::{DownstreamForwarder, ForwardOutcome};
pub use read::{ReadHandler, ReadOutcome};
pub use write::{WritePipelineHandler, WriteRequest, WriteStage};

use crate::error::{BlockError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Longest a stage waits on its peer (next packet or next ack) before
    /// treating the silence as an error.
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub(crate) async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            BlockError::Downstream(format!(
                "connect to {} timed out after {:?}",
                address, connect_timeout
            ))
        })?
        .map_err(|error| BlockError::Downstream(format!("connect to {} failed: {}", address, error)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
