//! Node abstractions for the consistent hash ring.
//!
//! Nodes represent physical storage processes. They are identified by a
//! compact `NodeId` that is cheap to compare and hash, and own a set of
//! virtual node tokens that place them on the ring.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::token::Token;
use crate::vnode::VirtualNode;

/// Default number of virtual nodes per physical node.
pub const DEFAULT_VNODES: usize = 128;

/// Compact identifier for a node in the cluster.
///
/// Also used as the component key of vector clocks, so it is serializable
/// and totally ordered.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Physical node participating in the ring.
///
/// Keep this struct small and cheap to clone; the storage engine and
/// connections live elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// Network address the node's replica endpoint listens on.
    pub address: String,
    /// Ring positions owned by this node.
    pub tokens: Vec<Token>,
}

impl Node {
    /// Construct a node with `vnodes` tokens derived from its id.
    pub fn new(id: NodeId, address: impl Into<String>, vnodes: usize) -> Self {
        let tokens = (0..vnodes)
            .map(|index| VirtualNode::from_index(id, index).token())
            .collect();
        Self {
            id,
            address: address.into(),
            tokens,
        }
    }

    /// Construct a node with explicitly assigned tokens.
    pub fn with_tokens(id: NodeId, address: impl Into<String>, tokens: Vec<Token>) -> Self {
        Self {
            id,
            address: address.into(),
            tokens,
        }
    }

    /// Iterate this node's virtual nodes.
    pub fn vnodes(&self) -> impl Iterator<Item = VirtualNode> + '_ {
        self.tokens
            .iter()
            .map(move |token| VirtualNode::new(*token, self.id))
    }
}
