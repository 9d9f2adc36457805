//! Quorum replication on top of the hash ring.
//!
//! This crate decides where each key lives and keeps its replicas in step:
//! - [`ReplicationCoordinator`] runs client reads and writes at the
//!   configured N/R/W quorum
//! - [`HintedHandoffManager`] buffers writes for replicas that missed them
//! - [`AntiEntropyService`] finds and repairs divergence with Merkle trees
//!
//! Replicas are reached through the [`Replica`] trait; [`LocalReplica`]
//! serves an in-process [`storage::StorageNode`].

pub mod antientropy;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handoff;
pub mod transport;

pub use antientropy::{AntiEntropyService, RoundReport, SyncReport};
pub use config::{AntiEntropyConfig, HandoffConfig, QuorumConfig};
pub use coordinator::{CoordinatorStats, ReplicationCoordinator, StatsSnapshot};
pub use error::{KvError, ReplicaError};
pub use handoff::{Hint, HintedHandoffManager};
pub use transport::{Liveness, LocalReplica, Peers, Replica, StaticLiveness};
