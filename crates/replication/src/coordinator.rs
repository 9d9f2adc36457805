//! Quorum coordinator: runs client operations across a key's replicas.
//!
//! A write is stamped by the first reachable node in the key's preference
//! list, which increments its own clock component and logs the entry. The
//! stamped entry is then sent to the other replicas concurrently and the
//! client returns once W replicas hold it. Reads ask every replica, wait for
//! R answers and reconcile them by vector clock.
//!
//! Replica calls are never cancelled. When the coordinator stops waiting,
//! whether because quorum was reached or the deadline passed, the
//! outstanding calls are drained by a background task that hints failed
//! writes and repairs stale reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::{HashRing, Node, NodeId};
use serde::Serialize;
use storage::protocol::{Request, Response};
use storage::{now_ms, reconcile, ConflictPolicy, KvEntry, StorageNode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::config::QuorumConfig;
use crate::error::{KvError, ReplicaError};
use crate::handoff::HintedHandoffManager;
use crate::transport::{Liveness, Peers, Replica};

type ReplicaResult = (NodeId, Result<Response, ReplicaError>);

/// Running totals kept by a coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    quorum_failures: AtomicU64,
    conflicts: AtomicU64,
    read_repairs: AtomicU64,
    hints: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub quorum_failures: u64,
    pub conflicts: u64,
    pub read_repairs: u64,
    pub hints: u64,
}

impl CoordinatorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            read_repairs: self.read_repairs.load(Ordering::Relaxed),
            hints: self.hints.load(Ordering::Relaxed),
        }
    }
}

/// Everything a detached replica task needs, cheap to clone.
#[derive(Clone)]
struct Shared {
    handoff: Arc<HintedHandoffManager>,
    stats: Arc<CoordinatorStats>,
}

impl Shared {
    fn hint(&self, target: NodeId, entry: &KvEntry) {
        self.handoff.store_hint(target, entry.clone());
        self.stats.hints.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ReplicationCoordinator {
    config: QuorumConfig,
    ring: Arc<HashRing>,
    peers: Arc<Peers>,
    liveness: Arc<dyn Liveness>,
    policy: ConflictPolicy,
    shared: Shared,
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("config", &self.config)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl ReplicationCoordinator {
    pub fn new(
        config: QuorumConfig,
        ring: Arc<HashRing>,
        peers: Arc<Peers>,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Self, KvError> {
        config.validate()?;
        Ok(Self {
            config,
            ring,
            peers,
            liveness,
            policy: ConflictPolicy::default(),
            shared: Shared {
                handoff: Arc::new(HintedHandoffManager::default()),
                stats: Arc::new(CoordinatorStats::default()),
            },
        })
    }

    /// Share a handoff manager with other components (e.g. its background
    /// replay task).
    pub fn with_handoff(mut self, handoff: Arc<HintedHandoffManager>) -> Self {
        self.shared.handoff = handoff;
        self
    }

    /// Policy used to resolve concurrent versions seen by reads. Should match
    /// the storage nodes'.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub fn handoff(&self) -> &Arc<HintedHandoffManager> {
        &self.shared.handoff
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Replica nodes for `key`, primary first.
    pub fn replicas_for(&self, key: &str) -> Vec<NodeId> {
        self.ring.preference_list(key.as_bytes(), self.config.n)
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    pub async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), KvError> {
        self.shared.stats.puts.fetch_add(1, Ordering::Relaxed);
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0);
        let request = Request::CoordinatePut {
            key: key.to_string(),
            value,
            ttl_ms,
        };
        self.write("put", key, request).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.shared.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let request = Request::CoordinateDelete { key: key.to_string() };
        self.write("delete", key, request).await
    }

    /// Read `key` at quorum R. `None` when the key is absent, deleted or
    /// expired.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        self.shared.stats.gets.fetch_add(1, Ordering::Relaxed);
        let winner = self.read("get", key).await?;
        Ok(winner.and_then(|entry| entry.live_value_at(now_ms()).cloned()))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        self.shared.stats.gets.fetch_add(1, Ordering::Relaxed);
        let winner = self.read("exists", key).await?;
        Ok(winner.is_some_and(|entry| entry.live_value_at(now_ms()).is_some()))
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub fn join(&self, node: Node, replica: Arc<dyn Replica>) -> Result<(), KvError> {
        let id = node.id;
        self.ring.add_node(node)?;
        self.peers.insert(replica);
        tracing::info!(node = %id, members = self.ring.node_count(), "node joined");
        Ok(())
    }

    /// Remove a node from the ring. Its pending hints are discarded; the
    /// remaining replicas pick up its ranges through anti-entropy.
    pub fn decommission(&self, id: NodeId) -> Option<Node> {
        let node = self.ring.remove_node(&id)?;
        self.peers.remove(&id);
        let discarded = self.shared.handoff.discard(id);
        tracing::info!(node = %id, discarded_hints = discarded, members = self.ring.node_count(), "node decommissioned");
        Some(node)
    }

    /// Replay hints owed to `node` now.
    pub async fn replay_hints(&self, node: NodeId) -> Result<usize, ReplicaError> {
        let replica = self.peers.get(&node).ok_or(ReplicaError::Unavailable(node))?;
        self.shared.handoff.replay_hints(node, replica.as_ref()).await
    }

    /// Replicate writes issued directly against `node` to the rest of each
    /// key's preference list. Runs until the node's outbox is replaced or
    /// dropped.
    pub fn spawn_outbox(&self, node: Arc<StorageNode>) -> JoinHandle<()> {
        let mut rx = node.attach_outbox();
        let origin = node.id();
        let ring = Arc::clone(&self.ring);
        let peers = Arc::clone(&self.peers);
        let liveness = Arc::clone(&self.liveness);
        let shared = self.shared.clone();
        let n = self.config.n;

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let targets: Vec<NodeId> = ring
                    .preference_list(entry.key().as_bytes(), n)
                    .into_iter()
                    .filter(|id| *id != origin)
                    .collect();
                let (tx, rx_results) = mpsc::unbounded_channel();
                let mut inflight = 0;
                for target in targets {
                    if dispatch(&peers, liveness.as_ref(), target, Request::ReplicatePut { entry: entry.clone() }, &tx) {
                        inflight += 1;
                    } else {
                        shared.hint(target, &entry);
                    }
                }
                drop(tx);
                if inflight > 0 {
                    tokio::spawn(drain_writes(rx_results, entry, shared.clone()));
                }
            }
            tracing::debug!(node = %origin, "outbox replication stopped");
        })
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    async fn write(&self, op: &'static str, key: &str, stamp: Request) -> Result<(), KvError> {
        let deadline = Instant::now() + self.config.timeout();
        let replicas = self.replicas_for(key);
        let w = self.config.w.min(replicas.len());
        if replicas.is_empty() {
            return Err(self.quorum_failure(op, key, self.config.w, 0));
        }

        // Stamp on the first replica that accepts the write.
        let mut stamped: Option<(usize, KvEntry)> = None;
        let mut skipped: Vec<NodeId> = Vec::new();
        let mut fence: Option<(NodeId, String)> = None;
        for (idx, &node) in replicas.iter().enumerate() {
            let Some(replica) = self.reachable(node) else {
                skipped.push(node);
                continue;
            };
            let call = tokio::spawn({
                let request = stamp.clone();
                async move { replica.call(request).await }
            });
            match timeout_at(deadline, call).await {
                Ok(Ok(Ok(Response::Stamped { entry }))) => {
                    stamped = Some((idx, entry));
                    break;
                }
                Ok(Ok(Ok(other))) => {
                    tracing::warn!(node = %node, op, response = ?other, "unexpected stamp response");
                    skipped.push(node);
                }
                Ok(Ok(Err(ReplicaError::Rejected { reason, fenced: true, .. }))) => {
                    tracing::warn!(node = %node, op, reason = %reason, "replica refuses writes");
                    fence.get_or_insert((node, reason));
                    skipped.push(node);
                }
                Ok(Ok(Err(err))) => {
                    tracing::debug!(node = %node, op, error = %err, "replica could not stamp write");
                    skipped.push(node);
                }
                Ok(Err(join_err)) => {
                    tracing::warn!(node = %node, op, error = %join_err, "stamp task failed");
                    skipped.push(node);
                }
                Err(_) => {
                    // The stamp may still land; anti-entropy reconciles it.
                    return Err(self.quorum_failure(op, key, w, 0));
                }
            }
        }

        let Some((stamper_idx, entry)) = stamped else {
            if let Some((node, reason)) = fence {
                return Err(KvError::Storage { node, reason });
            }
            return Err(self.quorum_failure(op, key, w, 0));
        };

        // Replicas ahead of the stamper missed the write.
        for node in &skipped {
            self.shared.hint(*node, &entry);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inflight = 0usize;
        for &node in &replicas[stamper_idx + 1..] {
            let request = Request::ReplicatePut { entry: entry.clone() };
            if dispatch(&self.peers, self.liveness.as_ref(), node, request, &tx) {
                inflight += 1;
            } else {
                self.shared.hint(node, &entry);
            }
        }
        drop(tx);

        let mut acks = 1usize;
        while acks < w && inflight > 0 {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((node, result))) => {
                    inflight -= 1;
                    match result {
                        Ok(Response::Ack) => acks += 1,
                        Ok(other) => {
                            tracing::warn!(node = %node, op, response = ?other, "unexpected replicate response");
                            self.shared.hint(node, &entry);
                        }
                        Err(err) => {
                            tracing::debug!(node = %node, op, error = %err, "replica write failed");
                            self.shared.hint(node, &entry);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if inflight > 0 {
            tokio::spawn(drain_writes(rx, entry.clone(), self.shared.clone()));
        }

        if acks < w {
            return Err(self.quorum_failure(op, key, w, acks));
        }
        tracing::debug!(op, key, acks, w, "write reached quorum");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    async fn read(&self, op: &'static str, key: &str) -> Result<Option<KvEntry>, KvError> {
        let deadline = Instant::now() + self.config.timeout();
        let replicas = self.replicas_for(key);
        let r = self.config.r.min(replicas.len());
        if replicas.is_empty() {
            return Err(self.quorum_failure(op, key, self.config.r, 0));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inflight = 0usize;
        for &node in &replicas {
            let request = Request::ReplicateGet { key: key.to_string() };
            if dispatch(&self.peers, self.liveness.as_ref(), node, request, &tx) {
                inflight += 1;
            }
        }
        drop(tx);

        let mut answers: Vec<(NodeId, Option<KvEntry>)> = Vec::new();
        while answers.len() < r && inflight > 0 {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((node, result))) => {
                    inflight -= 1;
                    match result {
                        Ok(Response::Entry { entry }) => answers.push((node, entry)),
                        Ok(other) => {
                            tracing::warn!(node = %node, op, response = ?other, "unexpected read response");
                        }
                        Err(err) => {
                            tracing::debug!(node = %node, op, error = %err, "replica read failed");
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if answers.len() < r {
            return Err(self.quorum_failure(op, key, r, answers.len()));
        }

        let winner = self.resolve(key, answers.iter().filter_map(|(_, entry)| entry.as_ref()));

        if self.config.read_repair {
            if let Some(winner) = &winner {
                let stale: Vec<NodeId> = answers
                    .iter()
                    .filter(|(_, entry)| entry.as_ref() != Some(winner))
                    .map(|(node, _)| *node)
                    .collect();
                let late = if inflight > 0 { Some(rx) } else { None };
                if !stale.is_empty() || late.is_some() {
                    self.spawn_read_repair(winner.clone(), stale, late);
                }
            }
        }

        Ok(winner)
    }

    /// Fold replica answers into one version, counting concurrent pairs.
    fn resolve<'a, I>(&self, key: &str, entries: I) -> Option<KvEntry>
    where
        I: IntoIterator<Item = &'a KvEntry>,
    {
        let mut winner: Option<KvEntry> = None;
        for entry in entries {
            winner = Some(match winner {
                None => entry.clone(),
                Some(current) => {
                    let resolution = reconcile(&self.policy, &current, entry);
                    if resolution.conflict {
                        self.shared.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("kv_read_conflicts_total").increment(1);
                        tracing::info!(key, "concurrent versions resolved on read");
                    }
                    resolution.winner
                }
            });
        }
        winner
    }

    fn spawn_read_repair(
        &self,
        winner: KvEntry,
        stale: Vec<NodeId>,
        late: Option<mpsc::UnboundedReceiver<ReplicaResult>>,
    ) {
        let peers = Arc::clone(&self.peers);
        let stats = Arc::clone(&self.shared.stats);

        tokio::spawn(async move {
            let mut targets = stale;
            if let Some(mut rx) = late {
                while let Some((node, result)) = rx.recv().await {
                    if let Ok(Response::Entry { entry }) = result {
                        if entry.as_ref() != Some(&winner) {
                            targets.push(node);
                        }
                    }
                }
            }

            for node in targets {
                let Some(replica) = peers.get(&node) else {
                    continue;
                };
                let request = Request::ReplicatePut { entry: winner.clone() };
                match replica.call(request).await {
                    Ok(_) => {
                        stats.read_repairs.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("kv_read_repairs_total").increment(1);
                        tracing::debug!(node = %node, key = winner.key(), "read repair applied");
                    }
                    Err(err) => {
                        tracing::debug!(node = %node, key = winner.key(), error = %err, "read repair failed");
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn reachable(&self, node: NodeId) -> Option<Arc<dyn Replica>> {
        if !self.liveness.is_alive(node) {
            return None;
        }
        self.peers.get(&node)
    }

    fn quorum_failure(&self, op: &'static str, key: &str, needed: usize, got: usize) -> KvError {
        self.shared.stats.quorum_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_quorum_failures_total", "op" => op).increment(1);
        tracing::warn!(op, key, needed, got, "quorum not reached");
        KvError::Quorum { op, needed, got }
    }
}

/// Spawn `request` against `node` if the liveness view and peer table allow
/// it. The result is sent on `tx`. Returns false when the node was not
/// contacted.
fn dispatch(
    peers: &Peers,
    liveness: &dyn Liveness,
    node: NodeId,
    request: Request,
    tx: &mpsc::UnboundedSender<ReplicaResult>,
) -> bool {
    if !liveness.is_alive(node) {
        return false;
    }
    let Some(replica) = peers.get(&node) else {
        return false;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = replica.call(request).await;
        // The coordinator may have stopped listening.
        let _ = tx.send((node, result));
    });
    true
}

/// Wait for the remaining replica writes and hint the ones that fail.
async fn drain_writes(mut rx: mpsc::UnboundedReceiver<ReplicaResult>, entry: KvEntry, shared: Shared) {
    while let Some((node, result)) = rx.recv().await {
        match result {
            Ok(Response::Ack) => {}
            Ok(_) | Err(_) => {
                tracing::debug!(node = %node, key = entry.key(), "straggling replica write failed; storing hint");
                shared.hint(node, &entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalReplica, StaticLiveness};
    use storage::{NodeConfig, SyncMode};

    struct Cluster {
        coordinator: ReplicationCoordinator,
        replicas: Vec<Arc<LocalReplica>>,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn cluster(nodes: u64, config: QuorumConfig) -> Cluster {
        let ring = Arc::new(HashRing::new());
        let peers = Arc::new(Peers::new());
        let coordinator =
            ReplicationCoordinator::new(config, ring, peers, Arc::new(StaticLiveness::new())).unwrap();

        let mut replicas = Vec::new();
        let mut dirs = Vec::new();
        for id in 1..=nodes {
            let dir = tempfile::tempdir().unwrap();
            let mut node_config = NodeConfig::new(dir.path());
            node_config.sync_mode = SyncMode::None;
            let node = Arc::new(StorageNode::open(NodeId(id), node_config).unwrap());
            let replica = Arc::new(LocalReplica::new(node));
            coordinator
                .join(Node::new(NodeId(id), format!("node-{id}"), 16), replica.clone())
                .unwrap();
            replicas.push(replica);
            dirs.push(dir);
        }
        Cluster {
            coordinator,
            replicas,
            _dirs: dirs,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let c = cluster(3, QuorumConfig::new(3, 2, 2));
        c.coordinator.put("user:1", Bytes::from_static(b"alice"), None).await.unwrap();

        assert_eq!(c.coordinator.get("user:1").await.unwrap(), Some(Bytes::from_static(b"alice")));
        assert!(c.coordinator.exists("user:1").await.unwrap());
        assert_eq!(c.coordinator.get("user:2").await.unwrap(), None);
        assert_eq!(c.coordinator.stats().puts, 1);
    }

    #[tokio::test]
    async fn test_delete_hides_value() {
        let c = cluster(3, QuorumConfig::new(3, 2, 2));
        c.coordinator.put("k", Bytes::from_static(b"v"), None).await.unwrap();
        c.coordinator.delete("k").await.unwrap();

        assert_eq!(c.coordinator.get("k").await.unwrap(), None);
        assert!(!c.coordinator.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_quorum_clamped_to_cluster_size() {
        let c = cluster(2, QuorumConfig::new(3, 3, 3));
        c.coordinator.put("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(c.coordinator.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_write_fails_without_quorum() {
        let c = cluster(3, QuorumConfig::new(3, 2, 2).with_timeout(Duration::from_millis(200)));
        let replicas = c.coordinator.replicas_for("k");
        for replica in &c.replicas {
            if replica.node().id() != replicas[0] {
                replica.set_reachable(false);
            }
        }

        let err = c.coordinator.put("k", Bytes::from_static(b"v"), None).await.unwrap_err();
        assert_eq!(err, KvError::Quorum { op: "put", needed: 2, got: 1 });
        assert!(err.is_retryable());
        assert_eq!(c.coordinator.stats().quorum_failures, 1);
        // The stamper keeps its partial write; the others are owed hints.
        assert_eq!(c.coordinator.handoff().total_pending(), 2);
    }

    #[tokio::test]
    async fn test_fenced_replicas_surface_storage_fault() {
        let c = cluster(1, QuorumConfig::new(1, 1, 1));
        let node = c.replicas[0].node();
        node.wal().inject_sync_failure();
        assert!(c.coordinator.put("a", Bytes::from_static(b"1"), None).await.is_err());

        let err = c.coordinator.put("b", Bytes::from_static(b"2"), None).await.unwrap_err();
        assert!(matches!(err, KvError::Storage { node: NodeId(1), .. }), "{err}");

        node.restore_log().unwrap();
        c.coordinator.put("b", Bytes::from_static(b"2"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = ReplicationCoordinator::new(
            QuorumConfig::new(3, 4, 2),
            Arc::new(HashRing::new()),
            Arc::new(Peers::new()),
            Arc::new(StaticLiveness::new()),
        )
        .unwrap_err();
        assert!(matches!(err, KvError::Config(_)));
    }

    #[tokio::test]
    async fn test_empty_ring_fails_quorum() {
        let c = cluster(0, QuorumConfig::default());
        let err = c.coordinator.get("k").await.unwrap_err();
        assert_eq!(err, KvError::Quorum { op: "get", needed: 2, got: 0 });
    }
}
