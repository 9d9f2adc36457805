//! Error types for replication.

use corelib::{NodeId, RingError};
use storage::StorageError;

/// Failure talking to one replica. These stay inside the coordinator, which
/// turns them into hints, retries or a quorum failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica {0} is unavailable")]
    Unavailable(NodeId),
    #[error("replica {0} did not answer before the deadline")]
    Timeout(NodeId),
    /// The replica answered but could not apply the request.
    #[error("replica {node} rejected the request: {reason}")]
    Rejected {
        node: NodeId,
        reason: String,
        /// Set when the replica refuses all writes until its log is restored.
        fenced: bool,
    },
    #[error("replica {node} sent an unexpected {kind} response")]
    Unexpected { node: NodeId, kind: String },
    #[error("codec: {0}")]
    Codec(String),
}

impl From<StorageError> for ReplicaError {
    fn from(err: StorageError) -> Self {
        ReplicaError::Codec(err.to_string())
    }
}

/// Errors returned to clients of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// Too few replicas answered in time. The operation may have been
    /// applied on some replicas and is safe to retry.
    #[error("{op} quorum not reached: needed {needed}, got {got}")]
    Quorum {
        op: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A replica refuses writes after a local storage failure; an operator
    /// must restore its log.
    #[error("node {node} storage fault: {reason}")]
    Storage { node: NodeId, reason: String },
    #[error(transparent)]
    Ring(#[from] RingError),
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Quorum { .. })
    }
}
