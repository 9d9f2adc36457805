//! Integration tests for the hash ring.
//!
//! # Test Strategy
//!
//! 1. **Basic functionality**: empty ring, add/lookup, remove
//! 2. **Preference lists**: distinct nodes, determinism, short rings
//! 3. **Rebalancing**: membership changes only move adjacent ranges
//! 4. **Properties**: proptest over random memberships and keys

use std::collections::HashSet;

use corelib::node::{Node, NodeId};
use corelib::ring::{HashRing, RingBuilder};
use corelib::{RingError, Xxh3Partitioner};
use proptest::prelude::*;

fn ring_with(ids: &[u64], vnodes: usize) -> HashRing {
    let ring = HashRing::new();
    for id in ids {
        ring.add_node(Node::new(NodeId(*id), format!("10.0.0.{id}:7000"), vnodes))
            .unwrap();
    }
    ring
}

// ============================================================================
// Basic Functionality Tests
// ============================================================================

#[test]
fn test_empty_ring_lookup() {
    let ring = HashRing::new();
    assert_eq!(ring.lookup(b"key1"), None);
    assert_eq!(ring.lookup_node(b"key1"), None);
    assert!(ring.preference_list(b"key1", 3).is_empty());
    assert_eq!(ring.node_count(), 0);
    assert_eq!(ring.token_count(), 0);
}

#[test]
fn test_add_node_and_lookup() {
    let ring = HashRing::new();
    ring.add_node(Node::new(NodeId(1), "node1", 4)).unwrap();

    assert_eq!(ring.node_count(), 1);
    assert_eq!(ring.token_count(), 4);
    assert_eq!(ring.lookup(b"test-key"), Some(NodeId(1)));
    assert_eq!(ring.lookup_node(b"test-key").unwrap().address, "node1");
    assert!(ring.get_node(&NodeId(1)).is_some());
}

#[test]
fn test_remove_node() {
    let ring = ring_with(&[1, 2], 4);
    assert_eq!(ring.token_count(), 8);

    let removed = ring.remove_node(&NodeId(1));
    assert_eq!(removed.map(|n| n.id), Some(NodeId(1)));
    assert_eq!(ring.node_count(), 1);
    assert_eq!(ring.token_count(), 4);
    assert_eq!(ring.lookup(b"some-key"), Some(NodeId(2)));

    assert!(ring.remove_node(&NodeId(999)).is_none());
}

#[test]
fn test_duplicate_add_is_rejected() {
    let ring = HashRing::new();
    let node = Node::new(NodeId(1), "node1", 4);
    ring.add_node(node.clone()).unwrap();

    assert_eq!(ring.add_node(node), Err(RingError::DuplicateNode(NodeId(1))));
    assert_eq!(ring.token_count(), 4);
}

#[test]
fn test_node_without_tokens_is_rejected() {
    let ring = HashRing::new();
    let err = ring
        .add_node(Node::with_tokens(NodeId(1), "node1", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, RingError::InvalidNode(_)));
}

#[test]
fn test_add_remove_add() {
    let ring = HashRing::new();
    ring.add_node(Node::new(NodeId(1), "node1", 4)).unwrap();
    assert!(ring.remove_node(&NodeId(1)).is_some());
    assert!(ring.is_empty());

    ring.add_node(Node::new(NodeId(1), "node1", 4)).unwrap();
    assert!(ring.lookup(b"key").is_some());
}

// ============================================================================
// Ring Builder Tests
// ============================================================================

#[test]
fn test_ring_builder_default() {
    let ring = RingBuilder::new()
        .add_node(NodeId(1), "node1")
        .add_node(NodeId(2), "node2")
        .build()
        .unwrap();

    assert_eq!(ring.node_count(), 2);
    assert_eq!(ring.token_count(), 256, "default is 128 vnodes per node");
    assert_eq!(ring.partitioner_name(), "SipPartitioner");
}

#[test]
fn test_ring_builder_mixed_vnodes() {
    let ring = RingBuilder::new()
        .with_vnodes(4)
        .with_partitioner(std::sync::Arc::new(Xxh3Partitioner))
        .add_node(NodeId(1), "node1")
        .add_node_with_vnodes(NodeId(2), "node2", 8)
        .build()
        .unwrap();

    assert_eq!(ring.token_count(), 12);
    assert_eq!(ring.partitioner_name(), "Xxh3Partitioner");
}

// ============================================================================
// Preference Lists
// ============================================================================

#[test]
fn test_preference_list_on_short_ring_returns_all_nodes() {
    let ring = ring_with(&[1, 2], 16);
    let replicas = ring.preference_list(b"user:1", 3);

    assert_eq!(replicas.len(), 2);
    let unique: HashSet<_> = replicas.iter().collect();
    assert_eq!(unique.len(), 2);
}

#[test]
fn test_preference_list_primary_matches_lookup() {
    let ring = ring_with(&[1, 2, 3, 4], 32);
    for i in 0..100 {
        let key = format!("key-{i}");
        let replicas = ring.preference_list(key.as_bytes(), 3);
        assert_eq!(Some(replicas[0]), ring.lookup(key.as_bytes()));
    }
}

// ============================================================================
// Rebalancing
// ============================================================================

#[test]
fn test_join_only_moves_keys_to_new_node() {
    let ring = ring_with(&[1, 2, 3], 64);
    let keys: Vec<String> = (0..2_000).map(|i| format!("key-{i}")).collect();
    let before: Vec<_> = keys.iter().map(|k| ring.lookup(k.as_bytes())).collect();

    ring.add_node(Node::new(NodeId(4), "node4", 64)).unwrap();
    let owned = ring.ranges_owned_by(&NodeId(4));

    let mut moved = 0;
    for (key, old) in keys.iter().zip(before) {
        let new = ring.lookup(key.as_bytes());
        if new != old {
            moved += 1;
            assert_eq!(new, Some(NodeId(4)), "keys only move to the joining node");
            let token = ring.token_for(key.as_bytes());
            assert!(owned.iter().any(|range| range.contains(token)));
        }
    }
    assert!(moved > 0, "a joining node takes over some keys");
    assert!(moved < keys.len() / 2, "most keys keep their owner");
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_preference_list_distinct_and_deterministic(
        ids in proptest::collection::btree_set(1u64..50, 1..8),
        key in "[a-z0-9:]{1,24}",
        n in 1usize..6,
    ) {
        let ids: Vec<u64> = ids.into_iter().collect();
        let ring = ring_with(&ids, 16);

        let first = ring.preference_list(key.as_bytes(), n);
        let second = ring.preference_list(key.as_bytes(), n);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), n.min(ids.len()));

        let unique: HashSet<_> = first.iter().collect();
        prop_assert_eq!(unique.len(), first.len());

        // Same membership inserted in reverse order gives the same answer.
        let reversed: Vec<u64> = ids.iter().rev().copied().collect();
        let other = ring_with(&reversed, 16);
        prop_assert_eq!(other.preference_list(key.as_bytes(), n), first);
    }
}
