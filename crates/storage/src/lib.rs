//! Local storage engine for one replica.
//!
//! Each physical node owns a [`StorageNode`]: an in-memory ordered map of
//! [`KvEntry`] values made durable by a [`WriteAheadLog`] and periodic
//! [`Snapshot`]s. The node also answers the node-to-node [`protocol`] that
//! the replication layer speaks, including the [`MerkleTree`] views used by
//! anti-entropy.

pub mod conflict;
pub mod entry;
pub mod error;
pub mod merkle;
pub mod node;
pub mod protocol;
pub mod snapshot;
pub mod wal;

pub use conflict::{reconcile, ConflictPolicy, Resolution};
pub use entry::{now_ms, KvEntry};
pub use error::{StorageError, WalError};
pub use merkle::{Digest, MerkleTree};
pub use node::{ApplyOutcome, NodeConfig, RecoveryReport, StorageNode};
pub use protocol::{KeySpan, Request, Response};
pub use snapshot::Snapshot;
pub use wal::{LogEntry, OpKind, SyncMode, WriteAheadLog};
