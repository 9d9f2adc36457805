//! Hinted handoff.
//!
//! When a replica misses a write, the coordinator parks the stamped entry
//! here as a hint addressed to that replica. Hints are replayed in the order
//! they were stored once the target is reachable again. A replay that fails
//! part way puts the unsent hints back at the front of the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corelib::NodeId;
use dashmap::DashMap;
use storage::protocol::{Request, Response};
use storage::KvEntry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HandoffConfig;
use crate::error::ReplicaError;
use crate::transport::{Liveness, Peers, Replica};

/// A write owed to `target`.
#[derive(Debug, Clone)]
pub struct Hint {
    pub target: NodeId,
    pub entry: KvEntry,
    pub created_at: Instant,
}

#[derive(Debug, Default)]
pub struct HintedHandoffManager {
    config: HandoffConfig,
    queues: DashMap<NodeId, VecDeque<Hint>>,
    stored: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
}

impl HintedHandoffManager {
    pub fn new(config: HandoffConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn store_hint(&self, target: NodeId, entry: KvEntry) {
        let mut queue = self.queues.entry(target).or_default();
        if queue.len() >= self.config.max_hints_per_node.max(1) {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kv_hints_dropped_total").increment(1);
            tracing::warn!(node = %target, cap = self.config.max_hints_per_node, "hint queue full; dropped oldest hint");
        }
        tracing::debug!(node = %target, key = entry.key(), "hint stored");
        queue.push_back(Hint {
            target,
            entry,
            created_at: Instant::now(),
        });
        self.stored.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_hints_stored_total").increment(1);
    }

    /// Hints waiting for `node`.
    pub fn pending(&self, node: NodeId) -> usize {
        self.queues.get(&node).map_or(0, |q| q.len())
    }

    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Nodes with at least one hint queued, in id order.
    pub fn targets(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .queues
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| *q.key())
            .collect();
        nodes.sort();
        nodes
    }

    /// Hints currently queued for `node`, oldest first.
    pub fn hints_for(&self, node: NodeId) -> Vec<Hint> {
        self.queues
            .get(&node)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stored_total(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn replayed_total(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forget every hint for a node that has left the cluster.
    pub fn discard(&self, node: NodeId) -> usize {
        self.queues.remove(&node).map_or(0, |(_, q)| q.len())
    }

    /// Drop hints older than the retention window. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let retention = self.config.retention();
        let mut purged = 0;
        for mut queue in self.queues.iter_mut() {
            let before = queue.len();
            queue.retain(|hint| hint.created_at.elapsed() < retention);
            purged += before - queue.len();
        }
        self.queues.retain(|_, q| !q.is_empty());
        if purged > 0 {
            self.dropped.fetch_add(purged as u64, Ordering::Relaxed);
            metrics::counter!("kv_hints_expired_total").increment(purged as u64);
            tracing::info!(purged, "expired hints purged");
        }
        purged
    }

    /// Send every hint queued for `node` to `replica`, oldest first. Stops at
    /// the first failure and re-queues that hint and the rest ahead of any
    /// hints stored meanwhile.
    pub async fn replay_hints(&self, node: NodeId, replica: &dyn Replica) -> Result<usize, ReplicaError> {
        let Some((_, mut batch)) = self.queues.remove(&node) else {
            return Ok(0);
        };
        let retention = self.config.retention();
        let mut delivered = 0;

        while let Some(hint) = batch.pop_front() {
            if hint.created_at.elapsed() >= retention {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let request = Request::HintReplay {
                entry: hint.entry.clone(),
            };
            let failure = match replica.call(request).await {
                Ok(Response::Ack) => None,
                Ok(other) => Some(ReplicaError::Unexpected {
                    node,
                    kind: format!("{other:?}"),
                }),
                Err(err) => Some(err),
            };

            if let Some(err) = failure {
                batch.push_front(hint);
                let remaining = batch.len();
                self.requeue(node, batch);
                tracing::warn!(node = %node, delivered, remaining, error = %err, "hint replay interrupted");
                return Err(err);
            }

            delivered += 1;
            self.replayed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kv_hints_replayed_total").increment(1);
        }

        if delivered > 0 {
            tracing::info!(node = %node, delivered, "hints replayed");
        }
        Ok(delivered)
    }

    fn requeue(&self, node: NodeId, mut unsent: VecDeque<Hint>) {
        let mut queue = self.queues.entry(node).or_default();
        unsent.extend(queue.drain(..));
        *queue = unsent;
    }

    /// Periodically purge stale hints and replay to every target the
    /// liveness view reports alive, until `shutdown` changes or its sender
    /// is dropped.
    pub fn spawn(
        self: Arc<Self>,
        peers: Arc<Peers>,
        liveness: Arc<dyn Liveness>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.replay_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                self.purge_expired();
                for node in self.targets() {
                    if !liveness.is_alive(node) {
                        continue;
                    }
                    let Some(replica) = peers.get(&node) else {
                        continue;
                    };
                    // Failures stay queued for the next tick.
                    let _ = self.replay_hints(node, replica.as_ref()).await;
                }
            }
            tracing::debug!("hinted handoff task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use corelib::VectorClock;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Acks the first `budget` hints, then fails.
    struct FlakyReplica {
        id: NodeId,
        budget: Mutex<usize>,
        seen: Mutex<Vec<String>>,
    }

    impl FlakyReplica {
        fn new(id: u64, budget: usize) -> Self {
            Self {
                id: NodeId(id),
                budget: Mutex::new(budget),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Replica for FlakyReplica {
        fn id(&self) -> NodeId {
            self.id
        }

        async fn call(&self, request: Request) -> Result<Response, ReplicaError> {
            let Request::HintReplay { entry } = request else {
                return Err(ReplicaError::Unexpected {
                    node: self.id,
                    kind: "request".into(),
                });
            };
            let mut budget = self.budget.lock();
            if *budget == 0 {
                return Err(ReplicaError::Unavailable(self.id));
            }
            *budget -= 1;
            self.seen.lock().push(entry.key().to_string());
            Ok(Response::Ack)
        }
    }

    fn entry(key: &str) -> KvEntry {
        let mut clock = VectorClock::new();
        clock.increment(NodeId(1));
        KvEntry::live(key, Bytes::from_static(b"v"), clock, 1, None)
    }

    fn keys(hints: &[Hint]) -> Vec<String> {
        hints.iter().map(|h| h.entry.key().to_string()).collect()
    }

    #[tokio::test]
    async fn test_replay_delivers_in_order() {
        let manager = HintedHandoffManager::new(HandoffConfig::default());
        for key in ["a", "b", "c"] {
            manager.store_hint(NodeId(2), entry(key));
        }
        let replica = FlakyReplica::new(2, 10);

        assert_eq!(manager.replay_hints(NodeId(2), &replica).await.unwrap(), 3);
        assert_eq!(*replica.seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(manager.pending(NodeId(2)), 0);
        assert_eq!(manager.replayed_total(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_replay_requeues_remaining_in_order() {
        let manager = HintedHandoffManager::new(HandoffConfig::default());
        for key in ["a", "b", "c", "d"] {
            manager.store_hint(NodeId(2), entry(key));
        }
        let replica = FlakyReplica::new(2, 1);

        let err = manager.replay_hints(NodeId(2), &replica).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Unavailable(_)));
        assert_eq!(keys(&manager.hints_for(NodeId(2))), vec!["b", "c", "d"]);

        // Hints stored after the failure queue behind the unsent ones.
        manager.store_hint(NodeId(2), entry("e"));
        *replica.budget.lock() = 10;
        assert_eq!(manager.replay_hints(NodeId(2), &replica).await.unwrap(), 4);
        assert_eq!(*replica.seen.lock(), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let manager = HintedHandoffManager::new(HandoffConfig {
            max_hints_per_node: 2,
            ..HandoffConfig::default()
        });
        for key in ["a", "b", "c"] {
            manager.store_hint(NodeId(5), entry(key));
        }
        assert_eq!(keys(&manager.hints_for(NodeId(5))), vec!["b", "c"]);
        assert_eq!(manager.dropped_total(), 1);
    }

    #[test]
    fn test_purge_expired() {
        let manager = HintedHandoffManager::new(HandoffConfig {
            retention_secs: 0,
            ..HandoffConfig::default()
        });
        manager.store_hint(NodeId(5), entry("a"));
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(manager.purge_expired(), 1);
        assert_eq!(manager.total_pending(), 0);
        assert!(manager.targets().is_empty());
    }
}
