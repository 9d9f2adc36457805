//! Core library for the replicated key-value store.
//!
//! This crate provides the placement and causality primitives shared by the
//! storage and replication crates:
//! - Node identity and virtual node tokens
//! - Partitioner strategies that hash keys onto the ring
//! - The consistent hash ring and its preference lists
//! - Vector clocks for detecting concurrent writes

pub mod error;
pub mod node;
pub mod partitioner;
pub mod ring;
pub mod token;
pub mod vclock;
pub mod vnode;

pub use error::{Result, RingError};
pub use node::{Node, NodeId};
pub use partitioner::{Partitioner, SipPartitioner, Xxh3Partitioner};
pub use ring::{HashRing, RingBuilder, TokenRange};
pub use token::Token;
pub use vclock::{ClockOrdering, VectorClock};
pub use vnode::VirtualNode;
