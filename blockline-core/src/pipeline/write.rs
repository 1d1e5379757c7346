use super::{DownstreamForwarder, PipelineOptions};
use crate::block::{BlockId, BlockInfo, ReplicaList};
use crate::error::{BlockError, Result};
use crate::protocol::{Status, read_packet, write_status};
use crate::storage::{BlockStore, PendingBlock};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

/// Stages of one write attempt, in order. Optional stages are skipped on the
/// chain tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    ReceiveHeader,
    ValidateFirst,
    ConnectDownstream,
    StreamPackets,
    WaitDownstreamAcks,
    CommitOrAbort,
    Respond,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub block_id: BlockId,
    pub checksums: bool,
    pub replicas: ReplicaList,
}

/// Accepts one block write, forwards it down the replica chain and commits
/// locally only once the whole chain confirmed.
///
/// A failed attempt answers `Error` upstream and leaves the local block
/// pending; it is never retried here.
#[derive(Clone)]
pub struct WritePipelineHandler {
    store: Arc<BlockStore>,
    node_address: String,
    options: PipelineOptions,
}

impl WritePipelineHandler {
    pub fn new(store: Arc<BlockStore>, node_address: String, options: PipelineOptions) -> Self {
        Self {
            store,
            node_address,
            options,
        }
    }

    pub async fn handle<R, W>(
        &self,
        request: WriteRequest,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<BlockInfo>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let block_id = request.block_id;
        let mut stage = WriteStage::ReceiveHeader;

        match self.run(request, reader, writer, &mut stage).await {
            Ok(block) => Ok(block),
            Err(error) => {
                tracing::warn!(
                    "Write of block {} failed at {:?}: {}",
                    block_id,
                    stage,
                    error
                );
                // Best effort: the upstream may already be gone.
                if let Err(send_error) = write_status(writer, Status::Error).await {
                    tracing::debug!(
                        "Could not send error for block {} upstream: {}",
                        block_id,
                        send_error
                    );
                }
                Err(error)
            }
        }
    }

    async fn run<R, W>(
        &self,
        request: WriteRequest,
        reader: &mut R,
        writer: &mut W,
        stage: &mut WriteStage,
    ) -> Result<BlockInfo>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let WriteRequest {
            block_id,
            checksums,
            replicas,
        } = request;

        *stage = WriteStage::ValidateFirst;
        if replicas.head() != self.node_address {
            return Err(BlockError::protocol(format!(
                "replica list head {} is not this node ({})",
                replicas.head(),
                self.node_address
            )));
        }
        let mut pending = self.store.create(block_id).await?;

        let packets = match self
            .transfer(block_id, checksums, &replicas, &mut pending, reader, writer, stage)
            .await
        {
            Ok(packets) => packets,
            Err(error) => {
                // Keep what arrived on disk; the entry stays pending.
                if let Err(release_error) = pending.release().await {
                    tracing::warn!(
                        "Could not write out partial block {}: {}",
                        block_id,
                        release_error
                    );
                }
                return Err(error);
            }
        };

        *stage = WriteStage::CommitOrAbort;
        let block = self.store.complete(pending.finish().await?).await?;

        *stage = WriteStage::Respond;
        write_status(writer, Status::Ok).await?;

        tracing::debug!(
            "Block {} written through {} replicas in {} packets",
            block_id,
            replicas.len(),
            packets
        );
        Ok(block)
    }

    /// Streams packets into `pending` and down the chain until the last one
    /// is confirmed everywhere. Returns the packet count.
    #[allow(clippy::too_many_arguments)]
    async fn transfer<R, W>(
        &self,
        block_id: BlockId,
        checksums: bool,
        replicas: &ReplicaList,
        pending: &mut PendingBlock,
        reader: &mut R,
        writer: &mut W,
        stage: &mut WriteStage,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        *stage = WriteStage::ConnectDownstream;
        let mut forwarder = match replicas.downstream() {
            Some(downstream) => {
                let mut forwarder =
                    DownstreamForwarder::start(block_id, checksums, downstream, self.options);
                // The header ack originates at the tail and is relayed back.
                forwarder.forward_confirmation().await?;
                Some(forwarder)
            }
            None => None,
        };
        write_status(writer, Status::Ok).await?;

        *stage = WriteStage::StreamPackets;
        let mut packets = 0u64;
        loop {
            let packet = timeout(self.options.ack_timeout, read_packet(reader, checksums))
                .await
                .map_err(|_| {
                    BlockError::protocol(format!(
                        "no packet from upstream within {:?}",
                        self.options.ack_timeout
                    ))
                })??;
            packets += 1;
            let last = packet.last;

            if let Some(forwarder) = forwarder.as_ref() {
                forwarder.add_packet(packet.clone()).await?;
            }
            pending.append(&packet.payload).await?;

            if last {
                break;
            }
            if let Some(forwarder) = forwarder.as_mut() {
                forwarder.forward_confirmation().await?;
            }
            write_status(writer, Status::Ok).await?;
        }

        if let Some(forwarder) = forwarder.as_mut() {
            *stage = WriteStage::WaitDownstreamAcks;
            forwarder.wait_for_confirmations().await?;
        }
        Ok(packets)
    }
}
