use crate::block::BlockId;
use crate::error::{BlockError, Result};
use crate::protocol::{ReadPreamble, Status, write_packet, write_status};
use crate::storage::BlockStore;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Completed { packets: u64, bytes: u64 },
    /// The client hung up mid-stream.
    Cancelled { packets: u64 },
}

/// Serves a byte range of a committed block as a packet stream.
#[derive(Clone)]
pub struct ReadHandler {
    store: Arc<BlockStore>,
}

impl ReadHandler {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }

    /// `length` of `None` reads to the end of the block.
    pub async fn handle<W>(
        &self,
        block_id: BlockId,
        offset: u64,
        length: Option<u64>,
        writer: &mut W,
    ) -> Result<ReadOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let mut block = match self.store.open_for_read(block_id).await {
            Ok(block) => block,
            Err(error) => {
                let _ = write_status(writer, Status::Error).await;
                return Err(error);
            }
        };
        let size = block.size();
        let layout = block.layout();

        let end = match length {
            Some(length) => offset.checked_add(length),
            None => Some(size),
        };
        let end = match end {
            Some(end) if offset <= size && end <= size => end,
            _ => {
                let _ = write_status(writer, Status::Error).await;
                return Err(BlockError::Range {
                    offset,
                    length: length.map_or(-1, |length| length.min(i64::MAX as u64) as i64),
                    size,
                });
            }
        };

        let (aligned_start, aligned_end) = layout.align(offset, end, size);
        let first_chunk = layout.chunk_index(aligned_start);
        // An empty range still gets one (empty, final) packet.
        let last_chunk = if aligned_end > aligned_start {
            layout.chunk_index(aligned_end - 1)
        } else {
            first_chunk
        };

        tracing::debug!(
            "Reading block {} bytes [{}, {}) as chunks {}..={}",
            block_id,
            offset,
            end,
            first_chunk,
            last_chunk
        );

        let mut packets = 0u64;
        let mut bytes = 0u64;
        let streamed: Result<()> = async {
            write_status(writer, Status::Ok).await?;
            ReadPreamble {
                checksums: layout.checksums,
                first_offset: aligned_start,
            }
            .write(writer)
            .await?;

            for index in first_chunk..=last_chunk {
                let packet = if aligned_end > aligned_start {
                    block.read_chunk(index, index == last_chunk).await?
                } else {
                    crate::protocol::Packet::new(bytes::Bytes::new(), true, layout.checksums)
                };
                write_packet(writer, &packet).await?;
                packets += 1;
                bytes += packet.len() as u64;
            }
            writer.flush().await?;
            Ok(())
        }
        .await;

        match streamed {
            Ok(()) => Ok(ReadOutcome::Completed { packets, bytes }),
            Err(error) if error.is_disconnect() => {
                tracing::info!(
                    "Client closed read of block {} after {} packets",
                    block_id,
                    packets
                );
                Ok(ReadOutcome::Cancelled { packets })
            }
            Err(error) => Err(error),
        }
    }
}
