//! Hash ring data structure.
//!
//! Holds a `BTreeMap<Token, NodeId>` of every virtual node plus the node
//! metadata, behind a single `RwLock` so lookups proceed in parallel and
//! membership changes are atomic.
//!
//! # Performance
//!
//! - **Lookup**: O(log t) to find the first token, then a clockwise walk
//!   until `count` distinct nodes are seen
//! - **Add/remove**: O(v log t) for v vnodes of the changed node

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, RingError};
use crate::node::{Node, NodeId, DEFAULT_VNODES};
use crate::partitioner::{Partitioner, SipPartitioner};
use crate::ring::range::TokenRange;
use crate::token::Token;

#[derive(Debug, Default)]
struct RingState {
    tokens: BTreeMap<Token, NodeId>,
    nodes: HashMap<NodeId, Node>,
}

impl RingState {
    /// Walk clockwise from `start` (inclusive), wrapping once.
    fn walk_from(&self, start: Token) -> impl Iterator<Item = (&Token, &NodeId)> {
        self.tokens.range(start..).chain(self.tokens.range(..start))
    }

    fn distinct_from(&self, start: Token, count: usize) -> Vec<NodeId> {
        let wanted = count.min(self.nodes.len());
        let mut seen = HashSet::with_capacity(wanted);
        let mut replicas = Vec::with_capacity(wanted);
        if wanted == 0 {
            return replicas;
        }
        for (_, node_id) in self.walk_from(start) {
            if seen.insert(*node_id) {
                replicas.push(*node_id);
                if replicas.len() == wanted {
                    break;
                }
            }
        }
        replicas
    }

    /// `(predecessor, token]` for every token, in ring order.
    fn arcs(&self) -> Vec<(TokenRange, NodeId)> {
        let Some((last, _)) = self.tokens.iter().next_back() else {
            return Vec::new();
        };
        let mut prev = *last;
        let mut arcs = Vec::with_capacity(self.tokens.len());
        for (token, node_id) in &self.tokens {
            arcs.push((TokenRange::new(prev, *token), *node_id));
            prev = *token;
        }
        arcs
    }
}

/// Consistent hash ring mapping tokens to physical nodes.
///
/// Interior mutability lets the ring be shared as `Arc<HashRing>` between the
/// coordinator and background services.
#[derive(Debug)]
pub struct HashRing {
    partitioner: Arc<dyn Partitioner>,
    state: RwLock<RingState>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRing {
    /// Empty ring using the default [`SipPartitioner`].
    pub fn new() -> Self {
        Self::with_partitioner(Arc::new(SipPartitioner))
    }

    pub fn with_partitioner(partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            partitioner,
            state: RwLock::new(RingState::default()),
        }
    }

    pub fn partitioner(&self) -> Arc<dyn Partitioner> {
        Arc::clone(&self.partitioner)
    }

    pub fn partitioner_name(&self) -> &'static str {
        self.partitioner.name()
    }

    /// Token a key hashes to.
    pub fn token_for(&self, key: &[u8]) -> Token {
        self.partitioner.token(key)
    }

    /// Insert every virtual token of `node`.
    ///
    /// A token already owned by another node is skipped (the earlier owner
    /// keeps it) so that two members never fight over one position.
    pub fn add_node(&self, node: Node) -> Result<()> {
        if node.tokens.is_empty() {
            return Err(RingError::InvalidNode(format!("{} has no tokens", node.id)));
        }
        let mut state = self.state.write();
        if state.nodes.contains_key(&node.id) {
            return Err(RingError::DuplicateNode(node.id));
        }
        let mut placed = 0usize;
        for token in &node.tokens {
            match state.tokens.get(token) {
                Some(owner) if *owner != node.id => {
                    tracing::warn!(node = %node.id, owner = %owner, token = %token, "token collision, skipping vnode");
                }
                _ => {
                    state.tokens.insert(*token, node.id);
                    placed += 1;
                }
            }
        }
        tracing::debug!(node = %node.id, vnodes = placed, "node added to ring");
        state.nodes.insert(node.id, node);
        Ok(())
    }

    /// Remove a node and all of its tokens.
    pub fn remove_node(&self, id: &NodeId) -> Option<Node> {
        let mut state = self.state.write();
        let node = state.nodes.remove(id)?;
        state.tokens.retain(|_, owner| owner != id);
        tracing::debug!(node = %id, "node removed from ring");
        Some(node)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.read().nodes.contains_key(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.state.read().nodes.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn token_count(&self) -> usize {
        self.state.read().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    /// All members, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let state = self.state.read();
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().into_iter().map(|node| node.id).collect()
    }

    /// Every `(token, owner)` pair in ring order.
    pub fn tokens(&self) -> Vec<(Token, NodeId)> {
        let state = self.state.read();
        state.tokens.iter().map(|(t, n)| (*t, *n)).collect()
    }

    /// Primary owner of `key`.
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        let token = self.token_for(key);
        let state = self.state.read();
        let mut walk = state.walk_from(token);
        walk.next().map(|(_, node_id)| *node_id)
    }

    pub fn lookup_node(&self, key: &[u8]) -> Option<Node> {
        let token = self.token_for(key);
        let state = self.state.read();
        let (_, node_id) = state.walk_from(token).next()?;
        state.nodes.get(node_id).cloned()
    }

    /// First `count` distinct physical nodes clockwise from `key`'s token.
    ///
    /// Returns every member when the ring has fewer than `count` nodes. The
    /// order is deterministic for fixed membership; the first entry is the
    /// primary owner.
    pub fn preference_list(&self, key: &[u8], count: usize) -> Vec<NodeId> {
        self.preference_list_for_token(self.token_for(key), count)
    }

    pub fn preference_list_for_token(&self, token: Token, count: usize) -> Vec<NodeId> {
        self.state.read().distinct_from(token, count)
    }

    /// Ranges for which `id` is the primary owner.
    ///
    /// These are exactly the ranges whose ownership moves when `id` joins or
    /// leaves; every other range keeps its owner.
    pub fn ranges_owned_by(&self, id: &NodeId) -> Vec<TokenRange> {
        let state = self.state.read();
        state
            .arcs()
            .into_iter()
            .filter(|(_, owner)| owner == id)
            .map(|(range, _)| range)
            .collect()
    }

    /// Every arc of the ring with its `n` replicas, primary first.
    pub fn replica_ranges(&self, n: usize) -> Vec<(TokenRange, Vec<NodeId>)> {
        let state = self.state.read();
        state
            .arcs()
            .into_iter()
            .map(|(range, _)| (range, state.distinct_from(range.end, n)))
            .collect()
    }

    /// Arcs grouped by the set of nodes replicating them.
    ///
    /// Keys are sorted replica sets; anti-entropy compares each set once
    /// instead of once per arc.
    pub fn replica_groups(&self, n: usize) -> BTreeMap<Vec<NodeId>, Vec<TokenRange>> {
        let mut groups: BTreeMap<Vec<NodeId>, Vec<TokenRange>> = BTreeMap::new();
        for (range, replicas) in self.replica_ranges(n) {
            let set: BTreeSet<NodeId> = replicas.into_iter().collect();
            groups.entry(set.into_iter().collect()).or_default().push(range);
        }
        groups
    }
}

/// Builder for a ring with a common vnode count and partitioner.
///
/// # Example
/// ```rust
/// use corelib::{NodeId, RingBuilder};
///
/// let ring = RingBuilder::new()
///     .with_vnodes(8)
///     .add_node(NodeId(1), "10.0.0.1:7000")
///     .add_node(NodeId(2), "10.0.0.2:7000")
///     .build()
///     .unwrap();
/// assert_eq!(ring.token_count(), 16);
/// ```
#[derive(Debug)]
pub struct RingBuilder {
    vnodes: usize,
    partitioner: Arc<dyn Partitioner>,
    pending: Vec<PendingNode>,
}

#[derive(Debug)]
enum PendingNode {
    Derived { id: NodeId, address: String, vnodes: Option<usize> },
    Explicit(Node),
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuilder {
    pub fn new() -> Self {
        Self {
            vnodes: DEFAULT_VNODES,
            partitioner: Arc::new(SipPartitioner),
            pending: Vec::new(),
        }
    }

    /// Vnode count for nodes added without an explicit count.
    pub fn with_vnodes(mut self, vnodes: usize) -> Self {
        self.vnodes = vnodes;
        self
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn add_node(mut self, id: NodeId, address: impl Into<String>) -> Self {
        self.pending.push(PendingNode::Derived {
            id,
            address: address.into(),
            vnodes: None,
        });
        self
    }

    pub fn add_node_with_vnodes(mut self, id: NodeId, address: impl Into<String>, vnodes: usize) -> Self {
        self.pending.push(PendingNode::Derived {
            id,
            address: address.into(),
            vnodes: Some(vnodes),
        });
        self
    }

    /// Add a node whose tokens are already assigned.
    pub fn add(mut self, node: Node) -> Self {
        self.pending.push(PendingNode::Explicit(node));
        self
    }

    pub fn build(self) -> Result<HashRing> {
        let ring = HashRing::with_partitioner(self.partitioner);
        for pending in self.pending {
            let node = match pending {
                PendingNode::Derived { id, address, vnodes } => {
                    Node::new(id, address, vnodes.unwrap_or(self.vnodes))
                }
                PendingNode::Explicit(node) => node,
            };
            ring.add_node(node)?;
        }
        Ok(ring)
    }
}
