//! Merkle-tree anti-entropy.
//!
//! Two replicas of the same key span are compared root first. Equal roots
//! end the exchange. Otherwise the walk descends one level at a time,
//! following only the subtrees whose hashes differ, until it reaches the
//! leaf buckets. The keys in those buckets are compared digest by digest
//! and every differing key is pushed in both directions; each replica
//! applies the other's version with its own conflict policy, so both end on
//! the same winner.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corelib::{HashRing, NodeId};
use parking_lot::Mutex;
use serde::Serialize;
use storage::merkle::{children_of, Digest, MAX_TREE_DEPTH};
use storage::protocol::{KeySpan, Request, Response};
use storage::KvEntry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AntiEntropyConfig;
use crate::error::ReplicaError;
use crate::transport::{Liveness, Peers, Replica};

/// Outcome of syncing one pair of replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub roots_matched: bool,
    /// Requests sent to the two replicas.
    pub round_trips: usize,
    pub buckets_compared: usize,
    pub keys_compared: usize,
    /// Entries pushed from one replica to the other.
    pub keys_pushed: usize,
}

/// Outcome of one pass over every replica group of the ring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub pairs_synced: usize,
    pub pairs_in_sync: usize,
    pub pairs_failed: usize,
    pub keys_pushed: usize,
}

pub struct AntiEntropyService {
    config: AntiEntropyConfig,
    replication_factor: usize,
    ring: Arc<HashRing>,
    peers: Arc<Peers>,
    liveness: Arc<dyn Liveness>,
    rounds: AtomicU64,
    last_round: Mutex<Option<RoundReport>>,
}

impl std::fmt::Debug for AntiEntropyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropyService")
            .field("config", &self.config)
            .field("replication_factor", &self.replication_factor)
            .finish_non_exhaustive()
    }
}

impl AntiEntropyService {
    pub fn new(
        config: AntiEntropyConfig,
        replication_factor: usize,
        ring: Arc<HashRing>,
        peers: Arc<Peers>,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self {
            config,
            replication_factor: replication_factor.max(1),
            ring,
            peers,
            liveness,
            rounds: AtomicU64::new(0),
            last_round: Mutex::new(None),
        }
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn last_round(&self) -> Option<RoundReport> {
        self.last_round.lock().clone()
    }

    /// Bring `a` and `b` into agreement over `span`.
    pub async fn sync_pair(&self, a: &dyn Replica, b: &dyn Replica, span: &KeySpan) -> Result<SyncReport, ReplicaError> {
        let depth = self.config.tree_depth.min(MAX_TREE_DEPTH);
        let mut report = SyncReport::default();

        let root = level_hashes(a, span, depth, 0, &[0], &mut report).await?;
        let root = root.first().copied().unwrap_or_default();
        report.round_trips += 1;
        let matched = match b
            .call(Request::AntiEntropySync {
                span: span.clone(),
                depth,
                root,
            })
            .await?
        {
            Response::SyncMatch => true,
            Response::SyncMismatch { .. } => false,
            other => return Err(unexpected(b.id(), &other)),
        };
        if matched {
            report.roots_matched = true;
            return Ok(report);
        }

        // Descend through the differing subtrees.
        let mut frontier = vec![0u32];
        for level in 1..=depth {
            let positions = children_of(&frontier);
            let ours = level_hashes(a, span, depth, level, &positions, &mut report).await?;
            let theirs = level_hashes(b, span, depth, level, &positions, &mut report).await?;
            frontier = positions
                .iter()
                .zip(ours.iter().zip(theirs.iter()))
                .filter(|(_, (x, y))| x != y)
                .map(|(&pos, _)| pos)
                .collect();
            if frontier.is_empty() {
                return Ok(report);
            }
        }
        report.buckets_compared = frontier.len();

        let ours = bucket_digests(a, span, depth, &frontier, &mut report).await?;
        let theirs = bucket_digests(b, span, depth, &frontier, &mut report).await?;
        let keys: BTreeSet<&String> = ours.keys().chain(theirs.keys()).collect();

        for key in keys {
            report.keys_compared += 1;
            if ours.get(key) == theirs.get(key) {
                continue;
            }
            let ea = fetch(a, key, &mut report).await?;
            let eb = fetch(b, key, &mut report).await?;
            if ea == eb {
                continue;
            }
            if let Some(entry) = ea {
                push(b, entry, &mut report).await?;
            }
            if let Some(entry) = eb {
                push(a, entry, &mut report).await?;
            }
        }

        tracing::debug!(
            a = %a.id(),
            b = %b.id(),
            buckets = report.buckets_compared,
            keys = report.keys_compared,
            pushed = report.keys_pushed,
            "replicas reconciled"
        );
        Ok(report)
    }

    /// Sync every pair of live replicas in every replica group of the ring.
    pub async fn run_round(&self) -> RoundReport {
        let mut round = RoundReport::default();
        let groups = self.ring.replica_groups(self.replication_factor);

        for (members, ranges) in groups {
            // With no more nodes than replicas every node holds every key.
            let span = if self.ring.node_count() <= self.replication_factor {
                KeySpan::all()
            } else {
                KeySpan::new(ranges)
            };
            let live: Vec<(NodeId, Arc<dyn Replica>)> = members
                .iter()
                .filter(|id| self.liveness.is_alive(**id))
                .filter_map(|id| self.peers.get(id).map(|r| (*id, r)))
                .collect();

            for i in 0..live.len() {
                for j in i + 1..live.len() {
                    let (a_id, a) = &live[i];
                    let (b_id, b) = &live[j];
                    match self.sync_pair(a.as_ref(), b.as_ref(), &span).await {
                        Ok(report) => {
                            round.pairs_synced += 1;
                            if report.roots_matched {
                                round.pairs_in_sync += 1;
                            }
                            round.keys_pushed += report.keys_pushed;
                        }
                        Err(err) => {
                            round.pairs_failed += 1;
                            tracing::warn!(a = %a_id, b = %b_id, error = %err, "anti-entropy sync failed");
                        }
                    }
                }
            }
        }

        self.rounds.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_anti_entropy_rounds_total").increment(1);
        metrics::counter!("kv_anti_entropy_keys_pushed_total").increment(round.keys_pushed as u64);
        tracing::info!(
            pairs = round.pairs_synced,
            in_sync = round.pairs_in_sync,
            failed = round.pairs_failed,
            pushed = round.keys_pushed,
            "anti-entropy round finished"
        );
        *self.last_round.lock() = Some(round.clone());
        round
    }

    /// Run a round every configured interval until `shutdown` changes or
    /// its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; let the cluster settle first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_round().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("anti-entropy task stopped");
        })
    }
}

async fn level_hashes(
    replica: &dyn Replica,
    span: &KeySpan,
    depth: u8,
    level: u8,
    positions: &[u32],
    report: &mut SyncReport,
) -> Result<Vec<Digest>, ReplicaError> {
    report.round_trips += 1;
    let request = Request::MerkleLevel {
        span: span.clone(),
        depth,
        level,
        positions: positions.to_vec(),
    };
    match replica.call(request).await? {
        Response::Hashes { hashes } if hashes.len() == positions.len() => Ok(hashes),
        other => Err(unexpected(replica.id(), &other)),
    }
}

async fn bucket_digests(
    replica: &dyn Replica,
    span: &KeySpan,
    depth: u8,
    buckets: &[u32],
    report: &mut SyncReport,
) -> Result<BTreeMap<String, Digest>, ReplicaError> {
    report.round_trips += 1;
    let request = Request::BucketDigests {
        span: span.clone(),
        depth,
        buckets: buckets.to_vec(),
    };
    match replica.call(request).await? {
        Response::Digests { digests } => Ok(digests.into_iter().collect()),
        other => Err(unexpected(replica.id(), &other)),
    }
}

async fn fetch(replica: &dyn Replica, key: &str, report: &mut SyncReport) -> Result<Option<KvEntry>, ReplicaError> {
    report.round_trips += 1;
    match replica.call(Request::ReplicateGet { key: key.to_string() }).await? {
        Response::Entry { entry } => Ok(entry),
        other => Err(unexpected(replica.id(), &other)),
    }
}

async fn push(replica: &dyn Replica, entry: KvEntry, report: &mut SyncReport) -> Result<(), ReplicaError> {
    report.round_trips += 1;
    match replica.call(Request::ReplicatePut { entry }).await? {
        Response::Ack => {
            report.keys_pushed += 1;
            Ok(())
        }
        other => Err(unexpected(replica.id(), &other)),
    }
}

fn unexpected(node: NodeId, response: &Response) -> ReplicaError {
    let kind = format!("{response:?}");
    let kind = kind
        .split(|c: char| c == ' ' || c == '{')
        .next()
        .unwrap_or_default()
        .to_string();
    ReplicaError::Unexpected { node, kind }
}
