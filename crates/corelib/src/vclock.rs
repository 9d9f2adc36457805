//! Vector clocks.
//!
//! A vector clock maps each node that has written a key to the number of
//! writes it has stamped. Comparing two clocks tells whether one version
//! causally follows the other or whether they were written concurrently.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Causal relationship of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Identical histories.
    Equal,
    /// Neither dominates: a write conflict the caller must resolve.
    Concurrent,
}

impl ClockOrdering {
    /// The relationship seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            ClockOrdering::Before => ClockOrdering::After,
            ClockOrdering::After => ClockOrdering::Before,
            other => other,
        }
    }
}

/// Per-key causality tracker.
///
/// Backed by a `BTreeMap` so iteration, encoding and digests are in node-id
/// order. Zero counters are never stored; a missing node reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump `node`'s counter by one.
    pub fn increment(&mut self, node: NodeId) {
        *self.counters.entry(node).or_insert(0) += 1;
    }

    /// Counter for `node`, zero if it never stamped this clock.
    pub fn get(&self, node: NodeId) -> u64 {
        self.counters.get(&node).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.counters.iter().map(|(node, counter)| (*node, *counter))
    }

    /// Compare across the union of node ids.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for node in self.counters.keys().chain(other.counters.keys()) {
            match self.get(*node).cmp(&other.get(*node)) {
                Ordering::Greater => self_ahead = true,
                Ordering::Less => other_ahead = true,
                Ordering::Equal => {}
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Pointwise maximum of both clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (node, counter) in other.iter() {
            let slot = merged.counters.entry(node).or_insert(0);
            *slot = (*slot).max(counter);
        }
        merged
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        let counters = iter.into_iter().filter(|(_, counter)| *counter > 0).collect();
        Self { counters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(entries: &[(u64, u64)]) -> VectorClock {
        entries.iter().map(|(n, c)| (NodeId(*n), *c)).collect()
    }

    #[test]
    fn test_increment() {
        let mut clock = VectorClock::new();
        clock.increment(NodeId(1));
        clock.increment(NodeId(1));
        clock.increment(NodeId(2));
        assert_eq!(clock.get(NodeId(1)), 2);
        assert_eq!(clock.get(NodeId(2)), 1);
        assert_eq!(clock.get(NodeId(3)), 0);
    }

    #[test]
    fn test_compare_before_after() {
        let a = vc(&[(1, 1)]);
        let b = vc(&[(1, 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn test_compare_missing_component_counts_as_zero() {
        let a = vc(&[(1, 1)]);
        let b = vc(&[(1, 1), (2, 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(VectorClock::new().compare(&a), ClockOrdering::Before);
    }

    #[test]
    fn test_compare_concurrent() {
        let a = vc(&[(1, 1)]);
        let b = vc(&[(2, 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_merge_dominates_both() {
        let a = vc(&[(1, 3), (2, 1)]);
        let b = vc(&[(2, 4), (3, 1)]);
        let merged = a.merge(&b);
        assert_eq!(merged, vc(&[(1, 3), (2, 4), (3, 1)]));
        assert_eq!(merged.compare(&a), ClockOrdering::After);
        assert_eq!(merged.compare(&b), ClockOrdering::After);
    }
}
