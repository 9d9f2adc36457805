//! Error types for the storage engine.

use std::io;

/// Failures of the write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("wal i/o: {0}")]
    Io(#[from] io::Error),
    /// A previous append failed to reach stable storage. Writes stay
    /// rejected until the log is restored.
    #[error("wal is unhealthy after a failed write; restore the log before writing")]
    Unhealthy,
    #[error("wal corrupted at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("checkpoint at seq {requested} is ahead of the last logged seq {last}")]
    CheckpointAhead { requested: u64, last: u64 },
}

/// Failures of a storage node.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("codec: {0}")]
    Codec(String),
}

impl StorageError {
    /// Whether the node can no longer accept writes until an operator
    /// restores its log.
    pub fn is_write_fence(&self) -> bool {
        matches!(self, StorageError::Wal(WalError::Unhealthy))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}
