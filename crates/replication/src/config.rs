//! Replication settings.
//!
//! All three structs deserialize with defaults for missing fields, so a
//! config file only names what it changes. Durations are integer
//! milliseconds or seconds on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KvError;

/// N/R/W quorum sizes. Fixed once a coordinator is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Replicas per key.
    pub n: usize,
    /// Responses a read waits for.
    pub r: usize,
    /// Acks a write waits for.
    pub w: usize,
    /// Per-operation deadline.
    pub timeout_ms: u64,
    /// Push the resolved version to stale responders after a read.
    pub read_repair: bool,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            n: 3,
            r: 2,
            w: 2,
            timeout_ms: 1_000,
            read_repair: true,
        }
    }
}

impl QuorumConfig {
    pub fn new(n: usize, r: usize, w: usize) -> Self {
        Self {
            n,
            r,
            w,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_repair(mut self, enabled: bool) -> Self {
        self.read_repair = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether every read quorum overlaps every write quorum.
    pub fn is_strict(&self) -> bool {
        self.r + self.w > self.n
    }

    pub fn validate(&self) -> Result<(), KvError> {
        if self.n == 0 {
            return Err(KvError::Config("n must be at least 1".into()));
        }
        if self.r == 0 || self.r > self.n {
            return Err(KvError::Config(format!("r must be in 1..={}, got {}", self.n, self.r)));
        }
        if self.w == 0 || self.w > self.n {
            return Err(KvError::Config(format!("w must be in 1..={}, got {}", self.n, self.w)));
        }
        if self.timeout_ms == 0 {
            return Err(KvError::Config("timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Oldest hints are dropped beyond this many per target.
    pub max_hints_per_node: usize,
    /// Hints older than this are discarded; anti-entropy covers the rest.
    pub retention_secs: u64,
    /// How often the background task looks for recovered targets.
    pub replay_interval_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_hints_per_node: 10_000,
            retention_secs: 3 * 60 * 60,
            replay_interval_ms: 1_000,
        }
    }
}

impl HandoffConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiEntropyConfig {
    /// Merkle tree depth; the tree has `2^depth` leaf buckets.
    pub tree_depth: u8,
    pub interval_ms: u64,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            tree_depth: storage::merkle::DEFAULT_TREE_DEPTH,
            interval_ms: 30_000,
        }
    }
}

impl AntiEntropyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid_and_strict() {
        let config = QuorumConfig::default();
        config.validate().unwrap();
        assert!(config.is_strict());
        assert_eq!(config.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_sloppy_quorum_is_valid() {
        let config = QuorumConfig::new(3, 1, 1);
        config.validate().unwrap();
        assert!(!config.is_strict());
    }

    #[test]
    fn test_out_of_range_quorums_are_rejected() {
        assert!(matches!(QuorumConfig::new(0, 1, 1).validate(), Err(KvError::Config(_))));
        assert!(matches!(QuorumConfig::new(3, 4, 1).validate(), Err(KvError::Config(_))));
        assert!(matches!(QuorumConfig::new(3, 2, 0).validate(), Err(KvError::Config(_))));
        assert!(matches!(
            QuorumConfig::new(3, 2, 2).with_timeout(Duration::ZERO).validate(),
            Err(KvError::Config(_))
        ));
    }
}
