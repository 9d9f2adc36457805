//! `kvctl`: operate a replicated key-value store from the command line.
//!
//! Each invocation opens every node of the cluster in-process from its data
//! directory, runs one command through the replication coordinator and
//! exits.

pub mod cluster;
pub mod commands;
pub mod config;

pub use cluster::{ClusterStatus, LocalCluster, NodeStatus};
pub use commands::{execute, run, Cli, Command};
pub use config::KvctlConfig;
