//! An in-process cluster over on-disk node directories.
//!
//! Every `kvctl` invocation reopens each node from its data directory,
//! replaying snapshot and log, and wires the nodes into one coordinator.
//! Hints live in memory only, so hints owed to nodes marked down are lost
//! when the process exits. `kvctl repair` reconciles what they would have
//! carried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use corelib::{HashRing, Node, NodeId};
use replication::{
    AntiEntropyService, HintedHandoffManager, LocalReplica, Peers, ReplicationCoordinator, RoundReport,
    StaticLiveness, StatsSnapshot,
};
use serde::Serialize;
use storage::{NodeConfig, StorageNode};

use crate::config::KvctlConfig;

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: u64,
    pub up: bool,
    pub writable: bool,
    pub keys: usize,
    pub wal_next_seq: u64,
    pub conflicts_resolved: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub n: usize,
    pub r: usize,
    pub w: usize,
    pub strict_quorum: bool,
    pub nodes: Vec<NodeStatus>,
    pub pending_hints: usize,
    pub stats: StatsSnapshot,
}

pub struct LocalCluster {
    config: KvctlConfig,
    coordinator: ReplicationCoordinator,
    replicas: BTreeMap<NodeId, Arc<LocalReplica>>,
    liveness: Arc<StaticLiveness>,
}

impl LocalCluster {
    pub fn open(config: &KvctlConfig) -> anyhow::Result<Self> {
        let ring = Arc::new(HashRing::new());
        let peers = Arc::new(Peers::new());
        let liveness = Arc::new(StaticLiveness::new());
        let coordinator = ReplicationCoordinator::new(config.quorum.clone(), ring, peers, liveness.clone())?
            .with_handoff(Arc::new(HintedHandoffManager::new(config.handoff.clone())));

        let mut replicas = BTreeMap::new();
        for id in 1..=config.nodes {
            let dir = config.node_dir(id);
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            let node_config = NodeConfig {
                data_dir: dir.clone(),
                sync_mode: config.sync_mode,
                ..NodeConfig::default()
            };
            let node = StorageNode::open(NodeId(id), node_config)
                .with_context(|| format!("opening node {id} at {}", dir.display()))?;
            let replica = Arc::new(LocalReplica::new(Arc::new(node)));
            coordinator.join(
                Node::new(NodeId(id), format!("local:{id}"), config.vnodes),
                replica.clone(),
            )?;
            replicas.insert(NodeId(id), replica);
        }
        tracing::debug!(nodes = config.nodes, data_dir = %config.data_dir.display(), "cluster opened");

        Ok(Self {
            config: config.clone(),
            coordinator,
            replicas,
            liveness,
        })
    }

    pub fn coordinator(&self) -> &ReplicationCoordinator {
        &self.coordinator
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<StorageNode>> {
        self.replicas.get(&id).map(|replica| replica.node())
    }

    /// Treat `id` as offline for this invocation.
    pub fn mark_down(&self, id: NodeId) -> anyhow::Result<()> {
        let replica = self
            .replicas
            .get(&id)
            .with_context(|| format!("no node {id} in a {}-node cluster", self.config.nodes))?;
        replica.set_reachable(false);
        self.liveness.mark_down(id);
        Ok(())
    }

    fn is_up(&self, id: NodeId) -> bool {
        self.replicas.get(&id).is_some_and(|r| r.is_reachable())
    }

    /// Wait until every reachable replica of `key` holds the same version,
    /// or the quorum deadline passes. Writes still in flight when the
    /// process exits would otherwise be cut short.
    pub async fn settle(&self, key: &str) {
        let deadline = Instant::now() + self.config.quorum.timeout();
        let owners: Vec<&Arc<StorageNode>> = self
            .coordinator
            .replicas_for(key)
            .into_iter()
            .filter(|id| self.is_up(*id))
            .filter_map(|id| self.node(id))
            .collect();

        loop {
            let versions: Vec<_> = owners.iter().map(|node| node.entry(key)).collect();
            if versions.windows(2).all(|pair| pair[0] == pair[1]) {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(key, "replicas still diverge; run `kvctl repair`");
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Live keys matching `pattern` on any reachable node.
    pub fn keys(&self, pattern: &str) -> BTreeSet<String> {
        self.replicas
            .values()
            .filter(|replica| replica.is_reachable())
            .flat_map(|replica| replica.node().keys(pattern))
            .collect()
    }

    /// Snapshot every reachable node. Returns the sequence each snapshot
    /// covers.
    pub fn snapshot(&self) -> anyhow::Result<Vec<(NodeId, u64)>> {
        let mut taken = Vec::new();
        for (id, replica) in &self.replicas {
            if !replica.is_reachable() {
                continue;
            }
            let seq = replica
                .node()
                .snapshot()
                .with_context(|| format!("snapshotting node {id}"))?;
            taken.push((*id, seq));
        }
        Ok(taken)
    }

    /// Replay pending hints, then run one anti-entropy round.
    pub async fn repair(&self) -> RoundReport {
        for node in self.coordinator.handoff().targets() {
            if !self.is_up(node) {
                continue;
            }
            if let Err(err) = self.coordinator.replay_hints(node).await {
                tracing::warn!(node = %node, error = %err, "hint replay failed");
            }
        }

        let service = AntiEntropyService::new(
            self.config.anti_entropy.clone(),
            self.config.quorum.n,
            Arc::clone(self.coordinator.ring()),
            Arc::clone(self.coordinator.peers()),
            self.liveness.clone(),
        );
        service.run_round().await
    }

    pub fn status(&self) -> ClusterStatus {
        let quorum = self.coordinator.config();
        let nodes = self
            .replicas
            .iter()
            .map(|(id, replica)| {
                let node = replica.node();
                NodeStatus {
                    id: id.0,
                    up: replica.is_reachable(),
                    writable: node.is_writable(),
                    keys: node.len(),
                    wal_next_seq: node.wal().next_seq(),
                    conflicts_resolved: node.conflicts_resolved(),
                }
            })
            .collect();

        ClusterStatus {
            n: quorum.n,
            r: quorum.r,
            w: quorum.w,
            strict_quorum: quorum.is_strict(),
            nodes,
            pending_hints: self.coordinator.handoff().total_pending(),
            stats: self.coordinator.stats(),
        }
    }

    /// Log hints that will not survive this process.
    pub fn close(&self) {
        let pending = self.coordinator.handoff().total_pending();
        if pending > 0 {
            tracing::warn!(pending, "hints for offline nodes are dropped on exit; run `kvctl repair` later");
        }
    }
}
