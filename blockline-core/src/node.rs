use crate::error::{BlockError, Result};
use crate::pipeline::{PipelineOptions, ReadHandler, ReadOutcome, WritePipelineHandler, WriteRequest};
use crate::protocol::{OpHeader, Status, read_header, write_status};
use crate::storage::BlockStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub const DEFAULT_MAX_TRANSFERS: usize = 256;

/// Block transfer endpoint of a storage node: accepts connections, reads the
/// op header and hands the stream to the write or read handler.
pub struct DataNode {
    node_address: String,
    options: PipelineOptions,
    writes: WritePipelineHandler,
    reads: ReadHandler,
    permits: Arc<Semaphore>,
}

impl DataNode {
    /// `node_address` is the address other nodes use for this node in
    /// replica lists.
    pub fn new(
        store: Arc<BlockStore>,
        node_address: String,
        options: PipelineOptions,
        max_transfers: usize,
    ) -> Self {
        Self {
            writes: WritePipelineHandler::new(store.clone(), node_address.clone(), options),
            reads: ReadHandler::new(store),
            node_address,
            options,
            permits: Arc::new(Semaphore::new(max_transfers.max(1))),
        }
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    /// Accepts transfers until `shutdown` flips, then waits for in-flight
    /// transfers to finish.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(
            "Data node {} listening on {}",
            self.node_address,
            listener.local_addr()?
        );

        let mut transfers = JoinSet::new();
        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|error| BlockError::Internal(error.to_string()))?,
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let node = self.clone();
                        transfers.spawn(async move {
                            if let Err(error) = node.handle_connection(stream, peer).await {
                                tracing::debug!("Transfer from {} ended with error: {}", peer, error);
                            }
                            drop(permit);
                        });
                    }
                    Err(error) => {
                        tracing::warn!("Accept failed: {}", error);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }

            while transfers.try_join_next().is_some() {}
        }

        if !transfers.is_empty() {
            tracing::info!("Waiting for {} in-flight transfers", transfers.len());
        }
        while transfers.join_next().await.is_some() {}
        tracing::info!("Data node {} stopped", self.node_address);
        Ok(())
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let header = match timeout(self.options.ack_timeout, read_header(&mut reader)).await {
            Ok(Ok(header)) => header,
            Ok(Err(error)) => {
                tracing::warn!("Rejecting request from {}: {}", peer, error);
                let _ = write_status(&mut writer, Status::Error).await;
                return Err(error);
            }
            Err(_) => {
                let error = BlockError::protocol(format!(
                    "no request header from {} within {:?}",
                    peer, self.options.ack_timeout
                ));
                tracing::warn!("Rejecting request from {}: {}", peer, error);
                let _ = write_status(&mut writer, Status::Error).await;
                return Err(error);
            }
        };

        match header {
            OpHeader::Write {
                block_id,
                checksums,
                replicas,
            } => {
                tracing::debug!(
                    "Write of block {} from {} via {:?}",
                    block_id,
                    peer,
                    replicas.addresses()
                );
                let block = self
                    .writes
                    .handle(
                        WriteRequest {
                            block_id,
                            checksums,
                            replicas,
                        },
                        &mut reader,
                        &mut writer,
                    )
                    .await?;
                tracing::info!("Received block {} ({} bytes) from {}", block.block_id, block.size, peer);
            }
            OpHeader::Read {
                block_id,
                offset,
                length,
            } => {
                let outcome = match self.reads.handle(block_id, offset, length, &mut writer).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        tracing::warn!("Read of block {} from {} failed: {}", block_id, peer, error);
                        return Err(error);
                    }
                };
                if let ReadOutcome::Completed { packets, bytes } = outcome {
                    tracing::debug!(
                        "Served block {} to {}: {} packets, {} bytes",
                        block_id,
                        peer,
                        packets,
                        bytes
                    );
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}
