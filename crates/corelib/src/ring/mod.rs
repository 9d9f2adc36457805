//! Consistent hash ring implementation.
//!
//! The ring manages virtual node tokens and answers the placement questions
//! of the replication layer: which nodes own a key, in which order, and which
//! token ranges a node is responsible for.

pub mod range;
pub mod ring;

pub use range::TokenRange;
pub use ring::{HashRing, RingBuilder};
