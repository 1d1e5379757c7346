use crate::block::BlockId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockError>;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("block already exists: {0}")]
    DuplicateBlock(BlockId),

    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("range not satisfiable: offset={offset} length={length} size={size}")]
    Range { offset: u64, length: i64, size: u64 },

    #[error("downstream error: {0}")]
    Downstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BlockError {
    pub fn protocol(message: impl Into<String>) -> Self {
        BlockError::Protocol(message.into())
    }

    /// True when the peer went away rather than the local side failing.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BlockError::Io(error) => matches!(
                error.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BlockError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            BlockError::CoordinatorUnavailable(err.to_string())
        } else {
            BlockError::Http(err.to_string())
        }
    }
}
