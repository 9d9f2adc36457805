//! Partitioner abstraction for consistent hashing.
//!
//! Partitioners convert keys into tokens that can be placed on the hash
//! ring. The ring takes one as an injected strategy, so every member of a
//! cluster must be built with the same partitioner.

pub mod sip;
pub mod traits;
pub mod xxh3;

pub use sip::SipPartitioner;
pub use traits::Partitioner;
pub use xxh3::Xxh3Partitioner;
