use super::layout::ChunkLayout;
use crate::block::{BlockId, BlockInfo};
use crate::error::{BlockError, Result};
use crate::protocol::{Packet, verify_checksum};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

const PENDING_DIR: &str = "pending";
const CURRENT_DIR: &str = "current";

/// Notified after the store commits or removes blocks, outside the store
/// lock.
pub trait BlockListener: Send + Sync {
    fn block_committed(&self, block: BlockInfo);
    fn blocks_removed(&self, block_ids: &[BlockId]);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Sum of committed block sizes.
    pub used: u64,
    pub available: u64,
    pub capacity: u64,
    pub block_count: usize,
}

/// In-flight write of one block. `generation` tells successive writes of the
/// same id apart; `writer` is dead once the append handle is gone.
struct PendingEntry {
    generation: u64,
    started: Instant,
    writer: Weak<()>,
}

struct StoreState {
    committed: HashMap<BlockId, u64>,
    pending: HashMap<BlockId, PendingEntry>,
    next_generation: u64,
    usage: DiskUsage,
}

/// Per-node durable block storage.
///
/// Blocks are written under `pending/` and promoted into `current/` by a
/// rename in [`BlockStore::complete`]; readers only ever see `current/`.
pub struct BlockStore {
    data_dir: PathBuf,
    layout: ChunkLayout,
    state: Mutex<StoreState>,
    listener: OnceLock<Arc<dyn BlockListener>>,
}

impl BlockStore {
    /// Opens the store in `data_dir`, reconciling the in-memory sets with
    /// what is on disk.
    pub fn open(data_dir: PathBuf, checksums: bool) -> Result<Self> {
        std::fs::create_dir_all(data_dir.join(PENDING_DIR))?;
        std::fs::create_dir_all(data_dir.join(CURRENT_DIR))?;

        let layout = ChunkLayout::new(checksums).load_or_init(&data_dir)?;

        discard_leftover_pending(&data_dir.join(PENDING_DIR))?;
        let committed = scan_committed(&data_dir.join(CURRENT_DIR), &layout)?;

        let mut state = StoreState {
            committed,
            pending: HashMap::new(),
            next_generation: 1,
            usage: DiskUsage::default(),
        };
        refresh_usage(&data_dir, &mut state);

        tracing::info!(
            "Opened block store at {} with {} committed blocks ({} bytes)",
            data_dir.display(),
            state.usage.block_count,
            state.usage.used
        );

        Ok(Self {
            data_dir,
            layout,
            state: Mutex::new(state),
            listener: OnceLock::new(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn set_listener(&self, listener: Arc<dyn BlockListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("Block store listener already installed, ignoring replacement");
        }
    }

    /// Opens a new pending entry. At most one creation per block id can be
    /// in flight, and a committed id can never be created again.
    pub async fn create(&self, block_id: BlockId) -> Result<PendingBlock> {
        let writer = Arc::new(());
        let generation = {
            let mut state = self.state.lock().await;
            if state.committed.contains_key(&block_id) || state.pending.contains_key(&block_id) {
                return Err(BlockError::DuplicateBlock(block_id));
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.pending.insert(
                block_id,
                PendingEntry {
                    generation,
                    started: Instant::now(),
                    writer: Arc::downgrade(&writer),
                },
            );
            generation
        };

        let path = self.pending_path(block_id, generation);
        match fs::File::create(&path).await {
            Ok(file) => {
                tracing::debug!("Created pending block {} ({})", block_id, generation);
                Ok(PendingBlock {
                    block_id,
                    generation,
                    layout: self.layout,
                    file: BufWriter::new(file),
                    chunk: BytesMut::with_capacity(self.layout.chunk_size as usize),
                    size: 0,
                    _writer: writer,
                })
            }
            Err(error) => {
                let mut state = self.state.lock().await;
                if state
                    .pending
                    .get(&block_id)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    state.pending.remove(&block_id);
                }
                Err(error.into())
            }
        }
    }

    /// Promotes a finished block to committed. The rename is the only
    /// transition readers can observe. Fails if the pending entry the block
    /// was written under is gone.
    pub async fn complete(&self, block: FinishedBlock) -> Result<BlockInfo> {
        let FinishedBlock {
            block_id,
            generation,
            size,
            _writer,
        } = block;
        {
            let mut state = self.state.lock().await;
            let owned = state
                .pending
                .get(&block_id)
                .is_some_and(|entry| entry.generation == generation);
            if !owned {
                return Err(BlockError::Internal(format!(
                    "block {} is no longer pending under write {}",
                    block_id, generation
                )));
            }

            fs::rename(
                self.pending_path(block_id, generation),
                self.current_path(block_id),
            )
            .await?;

            state.pending.remove(&block_id);
            state.committed.insert(block_id, size);
            refresh_usage(&self.data_dir, &mut state);
        }

        tracing::info!("Committed block {} ({} bytes)", block_id, size);

        let info = BlockInfo { block_id, size };
        if let Some(listener) = self.listener.get() {
            listener.block_committed(info);
        }
        Ok(info)
    }

    /// Discards an unfinished write. Returns whether the entry was still
    /// pending under this handle.
    pub async fn abort_pending(&self, block: PendingBlock) -> Result<bool> {
        let (block_id, generation) = (block.block_id, block.generation);
        drop(block);
        self.discard_pending(block_id, generation).await
    }

    async fn discard_pending(&self, block_id: BlockId, generation: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .pending
            .get(&block_id)
            .is_some_and(|entry| entry.generation == generation);
        if !owned {
            return Ok(false);
        }
        state.pending.remove(&block_id);

        match fs::remove_file(self.pending_path(block_id, generation)).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        tracing::info!("Aborted pending block {}", block_id);
        Ok(true)
    }

    pub async fn open_for_read(&self, block_id: BlockId) -> Result<CommittedBlock> {
        let size = {
            let state = self.state.lock().await;
            state
                .committed
                .get(&block_id)
                .copied()
                .ok_or(BlockError::BlockNotFound(block_id))?
        };

        let file = match fs::File::open(self.current_path(block_id)).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockError::BlockNotFound(block_id));
            }
            Err(error) => return Err(error.into()),
        };

        Ok(CommittedBlock {
            block_id,
            size,
            layout: self.layout,
            file,
        })
    }

    /// Deletes committed blocks, skipping ids this node does not hold.
    /// Returns the ids actually removed.
    pub async fn remove(&self, block_ids: &[BlockId]) -> Result<Vec<BlockId>> {
        let mut removed = Vec::with_capacity(block_ids.len());
        {
            let mut state = self.state.lock().await;
            for block_id in block_ids {
                if state.committed.remove(block_id).is_none() {
                    tracing::warn!("Skipping removal of unknown block {}", block_id);
                    continue;
                }

                match fs::remove_file(self.current_path(*block_id)).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => {
                        tracing::warn!("Failed to delete block file {}: {}", block_id, error);
                    }
                }
                removed.push(*block_id);
            }
            refresh_usage(&self.data_dir, &mut state);
        }

        if !removed.is_empty() {
            tracing::info!("Removed {} blocks", removed.len());
            if let Some(listener) = self.listener.get() {
                listener.blocks_removed(&removed);
            }
        }
        Ok(removed)
    }

    /// Aborts pending entries older than `max_age` whose writer has gone
    /// away; these belong to writes that failed partway and were left for
    /// cleanup. Entries still held by a live writer are never swept.
    pub async fn sweep_stale_pending(&self, max_age: Duration) -> Result<usize> {
        let stale: Vec<(BlockId, u64)> = {
            let state = self.state.lock().await;
            state
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry.writer.strong_count() == 0 && entry.started.elapsed() > max_age
                })
                .map(|(block_id, entry)| (*block_id, entry.generation))
                .collect()
        };

        let mut swept = 0;
        for (block_id, generation) in stale {
            if self.discard_pending(block_id, generation).await? {
                swept += 1;
            }
        }
        Ok(swept)
    }

    pub async fn is_committed(&self, block_id: BlockId) -> bool {
        self.state.lock().await.committed.contains_key(&block_id)
    }

    pub async fn is_pending(&self, block_id: BlockId) -> bool {
        self.state.lock().await.pending.contains_key(&block_id)
    }

    pub async fn block_size(&self, block_id: BlockId) -> Option<u64> {
        self.state.lock().await.committed.get(&block_id).copied()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn usage(&self) -> DiskUsage {
        self.state.lock().await.usage
    }

    /// Full committed inventory, ordered by block id.
    pub async fn block_report(&self) -> Vec<BlockInfo> {
        let state = self.state.lock().await;
        let mut blocks: Vec<BlockInfo> = state
            .committed
            .iter()
            .map(|(block_id, size)| BlockInfo {
                block_id: *block_id,
                size: *size,
            })
            .collect();
        blocks.sort_by_key(|block| block.block_id);
        blocks
    }

    fn pending_path(&self, block_id: BlockId, generation: u64) -> PathBuf {
        self.data_dir
            .join(PENDING_DIR)
            .join(format!("{}.{}", block_id, generation))
    }

    fn current_path(&self, block_id: BlockId) -> PathBuf {
        self.data_dir.join(CURRENT_DIR).join(block_id.to_string())
    }
}

/// Append handle for a block being written. Incoming bytes are re-chunked
/// into the store's on-disk layout, whatever the packet boundaries were.
///
/// Dropping the handle without [`PendingBlock::finish`] leaves the entry
/// pending until [`BlockStore::sweep_stale_pending`] reclaims it.
pub struct PendingBlock {
    block_id: BlockId,
    generation: u64,
    layout: ChunkLayout,
    file: BufWriter<fs::File>,
    chunk: BytesMut,
    size: u64,
    _writer: Arc<()>,
}

impl PendingBlock {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn append(&mut self, mut data: &[u8]) -> Result<()> {
        let chunk_size = self.layout.chunk_size as usize;
        while !data.is_empty() {
            let take = (chunk_size - self.chunk.len()).min(data.len());
            self.chunk.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.size += take as u64;

            if self.chunk.len() == chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    /// Flushes the tail chunk and syncs the file, ready for
    /// [`BlockStore::complete`].
    pub async fn finish(mut self) -> Result<FinishedBlock> {
        self.write_out().await?;
        self.file.get_ref().sync_all().await?;
        Ok(FinishedBlock {
            block_id: self.block_id,
            generation: self.generation,
            size: self.size,
            _writer: self._writer,
        })
    }

    /// Writes out every byte received so far and lets go of the entry,
    /// which stays pending. Returns the logical size written.
    pub async fn release(mut self) -> Result<u64> {
        self.write_out().await?;
        Ok(self.size)
    }

    async fn write_out(&mut self) -> Result<()> {
        if !self.chunk.is_empty() {
            self.flush_chunk().await?;
        }
        self.file.flush().await?;
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        self.file.write_all(&self.chunk).await?;
        if self.layout.checksums {
            let crc = crate::protocol::checksum(&self.chunk);
            self.file.write_all(&crc.to_be_bytes()).await?;
        }
        self.chunk.clear();
        Ok(())
    }
}

/// A fully written pending block awaiting [`BlockStore::complete`].
pub struct FinishedBlock {
    block_id: BlockId,
    generation: u64,
    size: u64,
    _writer: Arc<()>,
}

impl FinishedBlock {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Read handle for a committed block.
pub struct CommittedBlock {
    block_id: BlockId,
    size: u64,
    layout: ChunkLayout,
    file: fs::File,
}

impl CommittedBlock {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Reads chunk `index` as a packet, verifying its stored checksum.
    pub async fn read_chunk(&mut self, index: u64, last: bool) -> Result<Packet> {
        let start = index * self.layout.chunk_size;
        if start > self.size || (start == self.size && self.size > 0) {
            return Err(BlockError::Range {
                offset: start,
                length: self.layout.chunk_size as i64,
                size: self.size,
            });
        }
        let len = (self.size - start).min(self.layout.chunk_size) as usize;
        if len == 0 {
            // Empty block: nothing on disk, still one packet on the wire.
            return Ok(Packet::new(Bytes::new(), last, self.layout.checksums));
        }

        self.file
            .seek(SeekFrom::Start(self.layout.disk_offset(index)))
            .await?;
        let mut payload = BytesMut::zeroed(len);
        self.file.read_exact(&mut payload).await?;

        let checksum = if self.layout.checksums {
            let stored = self.file.read_u32().await?;
            verify_checksum(&payload, stored)?;
            Some(stored)
        } else {
            None
        };

        Ok(Packet {
            payload: payload.freeze(),
            checksum,
            last,
        })
    }

    /// Reads the whole block into memory, verifying every chunk.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.size as usize);
        let chunks = self.size.div_ceil(self.layout.chunk_size);
        for index in 0..chunks {
            let packet = self.read_chunk(index, index + 1 == chunks).await?;
            out.extend_from_slice(&packet.payload);
        }
        Ok(out.freeze())
    }
}

fn discard_leftover_pending(pending_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(pending_dir)? {
        let entry = entry?;
        let path = entry.path();
        tracing::info!("Discarding leftover pending file {}", path.display());
        if let Err(error) = std::fs::remove_file(&path) {
            tracing::warn!("Failed to discard {}: {}", path.display(), error);
        }
    }
    Ok(())
}

fn scan_committed(current_dir: &Path, layout: &ChunkLayout) -> Result<HashMap<BlockId, u64>> {
    let mut committed = HashMap::new();
    for entry in std::fs::read_dir(current_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(block_id) = name.to_str().and_then(|name| name.parse::<BlockId>().ok()) else {
            tracing::warn!("Skipping unrecognised file {:?} in block store", name);
            continue;
        };

        let disk_len = entry.metadata()?.len();
        let Some(size) = layout.logical_size(disk_len) else {
            tracing::warn!(
                "Skipping block {} with inconsistent length {}",
                block_id,
                disk_len
            );
            continue;
        };
        committed.insert(block_id, size);
    }
    Ok(committed)
}

fn refresh_usage(data_dir: &Path, state: &mut StoreState) {
    state.usage.used = state.committed.values().sum();
    state.usage.block_count = state.committed.len();
    match (fs2::available_space(data_dir), fs2::total_space(data_dir)) {
        (Ok(available), Ok(capacity)) => {
            state.usage.available = available;
            state.usage.capacity = capacity;
        }
        (Err(error), _) | (_, Err(error)) => {
            tracing::warn!(
                "Failed to query free space for {}: {}",
                data_dir.display(),
                error
            );
        }
    }
}
