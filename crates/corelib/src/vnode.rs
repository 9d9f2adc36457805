//! Virtual node abstractions.
//!
//! # Virtual Nodes (VNodes) Concept
//!
//! Instead of each physical node having a single token on the ring, each node
//! owns many tokens (virtual nodes). This provides:
//!
//! 1. **Better Load Distribution**: more tokens, smoother distribution of keys
//! 2. **Bounded Rebalancing**: when a node joins or leaves, only the ranges
//!    adjacent to its tokens change owner
//! 3. **Fault Spreading**: the load of a failed node is picked up by many
//!    successors rather than one
//!
//! # Typical Configuration
//!
//! 100-200 vnodes per node; the workspace default is
//! [`DEFAULT_VNODES`](crate::node::DEFAULT_VNODES).

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::node::NodeId;
use crate::token::Token;

/// A virtual node on the hash ring.
///
/// Represents a single token position owned by a physical node.
///
/// # Invariants
///
/// - Every `VirtualNode` belongs to exactly one physical node
/// - Ordering is by token first, so a sorted list of vnodes is a ring walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualNode {
    /// Token position on the ring.
    pub token: Token,

    /// The physical node that owns this virtual node.
    pub node_id: NodeId,
}

impl VirtualNode {
    #[inline]
    pub fn new(token: Token, node_id: NodeId) -> Self {
        Self { token, node_id }
    }

    /// Create a virtual node from a node ID and vnode index.
    ///
    /// The token is SipHash-1-3 of `"<node_id>:<vnode_index>"`, independent
    /// of the key partitioner, so a node keeps its ring positions when the
    /// key hashing strategy changes.
    ///
    /// # Example
    /// ```rust
    /// use corelib::{NodeId, VirtualNode};
    ///
    /// let vnode0 = VirtualNode::from_index(NodeId(1), 0);
    /// let vnode1 = VirtualNode::from_index(NodeId(1), 1);
    /// assert_ne!(vnode0.token(), vnode1.token());
    /// ```
    pub fn from_index(node_id: NodeId, vnode_index: usize) -> Self {
        let vnode_key = format!("{}:{}", node_id, vnode_index);
        let mut hasher = SipHasher13::new();
        hasher.write(vnode_key.as_bytes());
        Self::new(Token(hasher.finish()), node_id)
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Clockwise distance to another virtual node.
    #[inline]
    pub fn distance_to(&self, other: &Self) -> u64 {
        self.token.distance_to(&other.token)
    }
}

impl std::fmt::Display for VirtualNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VNode(token={}, node={})", self.token, self.node_id)
    }
}
