use crate::error::{BlockError, Result};
use crate::protocol::MAX_PACKET_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const LAYOUT_VERSION: u32 = 1;
const CHECKSUM_LEN: u64 = 4;
const MARKER_FILE: &str = "store.json";

/// How block bytes are laid out in a block file: fixed-size chunks, each
/// optionally followed by its CRC-32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub version: u32,
    pub chunk_size: u64,
    pub checksums: bool,
}

impl ChunkLayout {
    pub fn new(checksums: bool) -> Self {
        Self {
            version: LAYOUT_VERSION,
            chunk_size: MAX_PACKET_PAYLOAD as u64,
            checksums,
        }
    }

    pub fn checksum_len(&self) -> u64 {
        if self.checksums { CHECKSUM_LEN } else { 0 }
    }

    /// Bytes one full chunk occupies on disk.
    pub fn stride(&self) -> u64 {
        self.chunk_size + self.checksum_len()
    }

    pub fn chunk_index(&self, logical_offset: u64) -> u64 {
        logical_offset / self.chunk_size
    }

    pub fn disk_offset(&self, chunk_index: u64) -> u64 {
        chunk_index * self.stride()
    }

    /// Aligns `[start, end)` outward to chunk boundaries, clamping the end to
    /// the block size.
    pub fn align(&self, start: u64, end: u64, size: u64) -> (u64, u64) {
        let aligned_start = start - start % self.chunk_size;
        let aligned_end = end.div_ceil(self.chunk_size) * self.chunk_size;
        (aligned_start, aligned_end.min(size))
    }

    pub fn disk_len(&self, size: u64) -> u64 {
        size + size.div_ceil(self.chunk_size) * self.checksum_len()
    }

    /// Logical size of a block file of `disk_len` bytes, or `None` when the
    /// length cannot come from this layout.
    pub fn logical_size(&self, disk_len: u64) -> Option<u64> {
        let full = disk_len / self.stride();
        let rest = disk_len % self.stride();
        let tail = match rest {
            0 => 0,
            r if r > self.checksum_len() => r - self.checksum_len(),
            _ => return None,
        };
        Some(full * self.chunk_size + tail)
    }

    /// Loads the marker in `data_dir`, writing `self` when none exists yet.
    /// An existing marker wins so files already on disk stay readable.
    pub fn load_or_init(self, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(MARKER_FILE);
        if path.exists() {
            let raw = std::fs::read(&path)?;
            let stored: ChunkLayout = serde_json::from_slice(&raw)?;
            if stored.version != LAYOUT_VERSION {
                return Err(BlockError::Config(format!(
                    "unsupported store layout version {} in {}",
                    stored.version,
                    path.display()
                )));
            }
            if stored.chunk_size != MAX_PACKET_PAYLOAD as u64 {
                return Err(BlockError::Config(format!(
                    "unsupported chunk size {} in {} (expected {})",
                    stored.chunk_size,
                    path.display(),
                    MAX_PACKET_PAYLOAD
                )));
            }
            if stored.checksums != self.checksums {
                tracing::warn!(
                    "Store at {} was created with checksums={}, ignoring configured checksums={}",
                    data_dir.display(),
                    stored.checksums,
                    self.checksums
                );
            }
            return Ok(stored);
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(self)
    }
}
