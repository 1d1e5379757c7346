use crate::error::{BlockError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Globally unique 128-bit block identifier.
///
/// New identifiers are minted as ULIDs, so they sort by creation time and are
/// never reused. The textual form (file names, JSON) is the 26-character ULID
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(u128);

impl BlockId {
    pub const LEN: usize = 16;

    pub fn generate() -> Self {
        Self(Ulid::new().0)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ulid(self.0))
    }
}

impl FromStr for BlockId {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(|ulid| Self(ulid.0))
            .map_err(|error| BlockError::protocol(format!("invalid block id '{}': {}", s, error)))
    }
}

impl TryFrom<String> for BlockId {
    type Error = BlockError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlockId> for String {
    fn from(value: BlockId) -> Self {
        value.to_string()
    }
}

/// A committed block as it appears in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub size: u64,
}

/// Ordered chain of node addresses that must end up holding a replica.
///
/// The node receiving a write is always the head; forwarding hands the tail
/// to the next hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaList(Vec<String>);

impl ReplicaList {
    pub fn new(addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(BlockError::protocol("replica list cannot be empty"));
        }
        Ok(Self(addresses))
    }

    pub fn head(&self) -> &str {
        &self.0[0]
    }

    /// The list the next hop receives, or `None` when the head is the tail.
    pub fn downstream(&self) -> Option<ReplicaList> {
        if self.0.len() > 1 {
            Some(Self(self.0[1..].to_vec()))
        } else {
            None
        }
    }

    pub fn is_tail(&self) -> bool {
        self.0.len() == 1
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.0
    }
}
