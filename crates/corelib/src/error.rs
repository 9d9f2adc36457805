//! Error types for the core library.

use crate::node::NodeId;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, RingError>;

/// Errors that can occur while mutating or querying the ring.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// A node with this id is already a ring member.
    #[error("node {0} is already a ring member")]
    DuplicateNode(NodeId),
    /// The node id is not a ring member.
    #[error("node {0} is not a ring member")]
    UnknownNode(NodeId),
    /// Invalid node configuration
    #[error("invalid node: {0}")]
    InvalidNode(String),
    /// The ring has no members.
    #[error("ring is empty")]
    EmptyRing,
}
