use crate::block::{BlockId, ReplicaList};
use crate::error::Result;
use crate::pipeline::{BlockWriter, PipelineOptions};
use crate::storage::BlockStore;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, watch};

/// Copy a committed local block to `targets` through a fresh write pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationCommand {
    pub block_id: BlockId,
    pub targets: ReplicaList,
}

struct QueueInner {
    commands: Mutex<VecDeque<ReplicationCommand>>,
    notify: Notify,
}

/// FIFO of replication work fed by coordinator commands.
#[derive(Clone)]
pub struct ReplicationQueue {
    inner: Arc<QueueInner>,
}

impl Default for ReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                commands: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub async fn push(&self, command: ReplicationCommand) {
        self.inner.commands.lock().await.push_back(command);
        self.inner.notify.notify_one();
    }

    /// Waits for the next command.
    pub async fn pop(&self) -> ReplicationCommand {
        loop {
            if let Some(command) = self.inner.commands.lock().await.pop_front() {
                return command;
            }
            self.inner.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.commands.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.commands.lock().await.is_empty()
    }
}

/// Drains the [`ReplicationQueue`] one block at a time.
pub struct ReplicationWorker {
    store: Arc<BlockStore>,
    queue: ReplicationQueue,
    options: PipelineOptions,
}

impl ReplicationWorker {
    pub fn new(store: Arc<BlockStore>, queue: ReplicationQueue, options: PipelineOptions) -> Self {
        Self {
            store,
            queue,
            options,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let command = tokio::select! {
                command = self.queue.pop() => command,
                _ = shutdown.changed() => break,
            };

            match self.replicate(&command).await {
                Ok(bytes) => tracing::info!(
                    "Replicated block {} ({} bytes) to {:?}",
                    command.block_id,
                    bytes,
                    command.targets.addresses()
                ),
                Err(error) => tracing::warn!(
                    "Replication of block {} to {:?} failed: {}",
                    command.block_id,
                    command.targets.addresses(),
                    error
                ),
            }
        }

        let dropped = self.queue.len().await;
        if dropped > 0 {
            tracing::info!("Replication worker stopped with {} commands queued", dropped);
        } else {
            tracing::info!("Replication worker stopped");
        }
    }

    /// Streams one committed block to the target chain. Blocks that are not
    /// committed here (yet, or any more) are skipped.
    pub async fn replicate(&self, command: &ReplicationCommand) -> Result<u64> {
        if !self.store.is_committed(command.block_id).await {
            tracing::warn!(
                "Skipping replication of block {}: not committed on this node",
                command.block_id
            );
            return Ok(0);
        }

        let mut block = self.store.open_for_read(command.block_id).await?;
        let layout = block.layout();
        let size = block.size();
        let chunks = if size == 0 {
            1
        } else {
            layout.chunk_index(size - 1) + 1
        };

        let mut writer = BlockWriter::connect(
            command.block_id,
            command.targets.clone(),
            layout.checksums,
            self.options,
        )
        .await?;

        for index in 0..chunks {
            let packet = block.read_chunk(index, index + 1 == chunks).await?;
            writer.send(packet).await?;
        }
        Ok(size)
    }
}
