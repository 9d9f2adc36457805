//! A single replica's storage engine.
//!
//! Reads go straight to an in-memory `BTreeMap`. Writes to one key are
//! serialized by a striped lock, appended to the WAL, then published to the
//! map, so a write is visible only once it is durable. Writes to different
//! keys proceed in parallel.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::{ClockOrdering, NodeId, Partitioner, SipPartitioner, VectorClock};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use xxhash_rust::xxh3::xxh3_64;

use crate::conflict::{reconcile, ConflictPolicy};
use crate::entry::{now_ms, KvEntry};
use crate::error::{StorageError, WalError};
use crate::merkle::{entry_digest, MerkleTree, MAX_TREE_DEPTH};
use crate::protocol::{KeySpan, Request, Response};
use crate::snapshot::Snapshot;
use crate::wal::{SyncMode, WriteAheadLog};

const SCAN_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub sync_mode: SyncMode,
    /// Number of per-key write locks. Keys hash onto stripes.
    pub lock_stripes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sync_mode: SyncMode::Data,
            lock_stripes: 64,
        }
    }
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// What `apply_replica` did with an incoming version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The incoming version dominated (or the key was absent) and replaced
    /// the local one.
    Applied,
    /// The local version already covers the incoming one.
    Stale,
    /// The versions were concurrent and were merged by the conflict policy.
    Merged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub snapshot_seq: u64,
    pub snapshot_entries: usize,
    pub replayed: usize,
}

struct CachedTree {
    span: KeySpan,
    depth: u8,
    generation: u64,
    /// First instant an entry in the tree expires; the tree is stale from
    /// then on even without a write.
    valid_until_ms: u64,
    tree: Arc<MerkleTree>,
}

pub struct StorageNode {
    id: NodeId,
    config: NodeConfig,
    partitioner: Arc<dyn Partitioner>,
    policy: ConflictPolicy,
    wal: WriteAheadLog,
    data: RwLock<BTreeMap<String, KvEntry>>,
    stripes: Vec<Mutex<()>>,
    /// Bumped on every map change; invalidates cached Merkle trees.
    generation: AtomicU64,
    tree_cache: Mutex<Option<CachedTree>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<KvEntry>>>,
    conflicts: AtomicU64,
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("data_dir", &self.config.data_dir)
            .field("policy", &self.policy)
            .finish()
    }
}

impl StorageNode {
    /// Open the node's data directory and rebuild its state from the latest
    /// snapshot plus the WAL records written after it.
    pub fn open(id: NodeId, config: NodeConfig) -> Result<Self, StorageError> {
        let wal = WriteAheadLog::open(&config.data_dir, config.sync_mode)?;
        let stripes = (0..config.lock_stripes.max(1)).map(|_| Mutex::new(())).collect();

        let node = Self {
            id,
            config,
            partitioner: Arc::new(SipPartitioner),
            policy: ConflictPolicy::default(),
            wal,
            data: RwLock::new(BTreeMap::new()),
            stripes,
            generation: AtomicU64::new(0),
            tree_cache: Mutex::new(None),
            outbox: Mutex::new(None),
            conflicts: AtomicU64::new(0),
        };
        let report = node.recover()?;
        tracing::info!(
            node = %id,
            dir = %node.config.data_dir.display(),
            snapshot_seq = report.snapshot_seq,
            replayed = report.replayed,
            "storage node opened"
        );
        Ok(node)
    }

    /// Partitioner used to place keys into anti-entropy spans. Must match
    /// the ring's.
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// Whether the node currently accepts writes.
    pub fn is_writable(&self) -> bool {
        self.wal.is_healthy()
    }

    /// Number of concurrent-version conflicts this node has resolved.
    pub fn conflicts_resolved(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Stream of locally stamped writes, for handing to a replication
    /// coordinator. Attaching again replaces the previous receiver.
    pub fn attach_outbox(&self) -> mpsc::UnboundedReceiver<KvEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbox.lock() = Some(tx);
        rx
    }

    // ------------------------------------------------------------------
    // Client-facing operations
    // ------------------------------------------------------------------

    /// Stamp and persist a new value. A zero or absent TTL never expires.
    pub fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<KvEntry, StorageError> {
        let _guard = self.stripe(key);
        let clock = self.next_clock(key);
        let entry = KvEntry::live(key, value, clock, now_ms(), ttl);
        self.commit(entry.clone())?;
        self.publish(&entry);
        Ok(entry)
    }

    /// Stamp and persist a tombstone. Deleting an absent key still writes
    /// one so the delete wins over older versions elsewhere.
    pub fn delete(&self, key: &str) -> Result<KvEntry, StorageError> {
        let _guard = self.stripe(key);
        let clock = self.next_clock(key);
        let entry = KvEntry::tombstone(key, clock, now_ms());
        self.commit(entry.clone())?;
        self.publish(&entry);
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entry(key).and_then(|entry| entry.value().cloned())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The stored version of `key`, tombstones included. Expired entries are
    /// hidden, and their value is dropped on the way out. The clock stays
    /// so a later write to the key still supersedes the expired version on
    /// replicas that have not read it yet.
    pub fn entry(&self, key: &str) -> Option<KvEntry> {
        let now = now_ms();
        let found = self.data.read().get(key).cloned()?;
        if !found.is_expired_at(now) {
            return Some(found);
        }
        if found.is_tombstone() {
            return None;
        }

        let _guard = self.stripe(key);
        let mut data = self.data.write();
        if let Some(stored) = data.get_mut(key) {
            if stored.is_expired_at(now) && !stored.is_tombstone() {
                *stored = stored.expired_remnant();
                tracing::trace!(node = %self.id, key, "expired value dropped");
            }
        }
        None
    }

    /// Live keys matching a glob pattern (`*` any run, `?` one character).
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now = now_ms();
        let mut out = Vec::new();
        self.scan(|entry| {
            if entry.live_value_at(now).is_some() && glob_match(pattern, entry.key()) {
                out.push(entry.key().to_string());
            }
        });
        out
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = now_ms();
        let mut count = 0;
        self.scan(|entry| {
            if entry.live_value_at(now).is_some() {
                count += 1;
            }
        });
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Merge a version stamped by another node.
    pub fn apply_replica(&self, incoming: KvEntry) -> Result<ApplyOutcome, StorageError> {
        let key = incoming.key().to_string();
        let _guard = self.stripe(&key);
        let current = self.data.read().get(&key).cloned();

        let Some(current) = current else {
            self.commit(incoming)?;
            return Ok(ApplyOutcome::Applied);
        };

        match incoming.clock().compare(current.clock()) {
            ClockOrdering::After => {
                self.commit(incoming)?;
                Ok(ApplyOutcome::Applied)
            }
            ClockOrdering::Before | ClockOrdering::Equal => Ok(ApplyOutcome::Stale),
            // An expired version never outranks a concurrent write.
            ClockOrdering::Concurrent if current.is_expired_at(now_ms()) => {
                let clock = current.clock().merge(incoming.clock());
                self.commit(incoming.with_clock(clock))?;
                Ok(ApplyOutcome::Applied)
            }
            ClockOrdering::Concurrent => {
                let resolution = reconcile(&self.policy, &current, &incoming);
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("kv_conflicts_resolved_total").increment(1);
                tracing::debug!(
                    node = %self.id,
                    key = %key,
                    winner_ts = resolution.winner.timestamp_ms(),
                    "resolved concurrent versions"
                );
                self.commit(resolution.winner)?;
                Ok(ApplyOutcome::Merged)
            }
        }
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Write a snapshot of the current map and drop the WAL prefix it
    /// covers. Returns the snapshot's sequence number.
    pub fn snapshot(&self) -> Result<u64, StorageError> {
        if !self.wal.is_healthy() {
            return Err(WalError::Unhealthy.into());
        }
        let (seq, entries) = {
            let _all: Vec<MutexGuard<'_, ()>> = self.stripes.iter().map(|s| s.lock()).collect();
            let seq = self.wal.last_seq();
            let entries: Vec<KvEntry> = self.data.read().values().cloned().collect();
            (seq, entries)
        };

        Snapshot { seq, entries }.write_to(&self.config.data_dir)?;
        if seq > 0 {
            let removed = self.wal.checkpoint(seq)?;
            metrics::counter!("kv_snapshots_total").increment(1);
            tracing::info!(node = %self.id, seq, removed, "wal checkpointed after snapshot");
        }
        Ok(seq)
    }

    /// Rebuild the map from the latest snapshot and the WAL. Running it
    /// again without intervening writes yields the same state.
    pub fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let _all: Vec<MutexGuard<'_, ()>> = self.stripes.iter().map(|s| s.lock()).collect();
        let mut data = BTreeMap::new();
        let mut report = RecoveryReport::default();

        if let Some(snapshot) = Snapshot::load(&self.config.data_dir)? {
            report.snapshot_seq = snapshot.seq;
            report.snapshot_entries = snapshot.entries.len();
            for entry in snapshot.entries {
                data.insert(entry.key().to_string(), entry);
            }
        }
        self.wal.advance_to(report.snapshot_seq);

        let snapshot_seq = report.snapshot_seq;
        let mut replayed = 0;
        self.wal.replay(|record| {
            if record.seq > snapshot_seq {
                data.insert(record.entry.key().to_string(), record.entry);
                replayed += 1;
            }
        })?;
        report.replayed = replayed;

        *self.data.write() = data;
        self.generation.fetch_add(1, Ordering::Release);
        Ok(report)
    }

    /// Re-validate the WAL after a write failure so the node accepts writes
    /// again.
    pub fn restore_log(&self) -> Result<(), StorageError> {
        self.wal.restore()?;
        tracing::info!(node = %self.id, "storage node accepting writes again");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Anti-entropy views
    // ------------------------------------------------------------------

    /// Merkle tree over the unexpired entries in `span`, cached until the
    /// next write or the first expiry among its entries.
    pub fn merkle_tree(&self, span: &KeySpan, depth: u8) -> Arc<MerkleTree> {
        let depth = depth.min(MAX_TREE_DEPTH);
        let generation = self.generation.load(Ordering::Acquire);
        let now = now_ms();
        {
            let cache = self.tree_cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.generation == generation
                    && now < cached.valid_until_ms
                    && cached.depth == depth
                    && &cached.span == span
                {
                    return Arc::clone(&cached.tree);
                }
            }
        }

        let mut items = Vec::new();
        let mut valid_until_ms = u64::MAX;
        self.scan(|entry| {
            if !entry.is_expired_at(now) && span.contains_key(self.partitioner.as_ref(), entry.key()) {
                if let Some(at) = entry.expires_at_ms() {
                    valid_until_ms = valid_until_ms.min(at);
                }
                items.push((entry.key().to_string(), entry_digest(entry)));
            }
        });
        let tree = Arc::new(MerkleTree::build(depth, items));

        *self.tree_cache.lock() = Some(CachedTree {
            span: span.clone(),
            depth,
            generation,
            valid_until_ms,
            tree: Arc::clone(&tree),
        });
        tree
    }

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong { node: self.id },
            Request::CoordinatePut { key, value, ttl_ms } => {
                let ttl = (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms));
                match self.put(&key, value, ttl) {
                    Ok(entry) => Response::Stamped { entry },
                    Err(err) => nack(err),
                }
            }
            Request::CoordinateDelete { key } => match self.delete(&key) {
                Ok(entry) => Response::Stamped { entry },
                Err(err) => nack(err),
            },
            Request::ReplicatePut { entry } | Request::HintReplay { entry } => {
                match self.apply_replica(entry) {
                    Ok(_) => Response::Ack,
                    Err(err) => nack(err),
                }
            }
            Request::ReplicateGet { key } => Response::Entry {
                entry: self.entry(&key),
            },
            Request::AntiEntropySync { span, depth, root } => {
                let local = self.merkle_tree(&span, depth).root();
                if local == root {
                    Response::SyncMatch
                } else {
                    Response::SyncMismatch { root: local }
                }
            }
            Request::MerkleLevel {
                span,
                depth,
                level,
                positions,
            } => Response::Hashes {
                hashes: self.merkle_tree(&span, depth).hashes_at(level, &positions),
            },
            Request::BucketDigests { span, depth, buckets } => Response::Digests {
                digests: self.merkle_tree(&span, depth).bucket_digests(&buckets),
            },
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn stripe(&self, key: &str) -> MutexGuard<'_, ()> {
        let idx = (xxh3_64(key.as_bytes()) % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock()
    }

    /// Clock for a new local write to `key`. Caller holds the key's stripe.
    fn next_clock(&self, key: &str) -> VectorClock {
        let mut clock = self
            .data
            .read()
            .get(key)
            .map(|entry| entry.clock().clone())
            .unwrap_or_default();
        clock.increment(self.id);
        clock
    }

    /// Log then publish. Caller holds the key's stripe.
    fn commit(&self, entry: KvEntry) -> Result<(), StorageError> {
        self.wal.append(&entry)?;
        self.data.write().insert(entry.key().to_string(), entry);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn publish(&self, entry: &KvEntry) {
        let mut outbox = self.outbox.lock();
        if let Some(tx) = outbox.as_ref() {
            if tx.send(entry.clone()).is_err() {
                *outbox = None;
            }
        }
    }

    /// Visit every stored entry in key order, releasing the map lock between
    /// chunks so long scans do not stall writers.
    fn scan<F>(&self, mut visit: F)
    where
        F: FnMut(&KvEntry),
    {
        let mut cursor: Option<String> = None;
        loop {
            let data = self.data.read();
            let lower = match cursor.take() {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            let mut seen = 0;
            let mut last = None;
            for (key, entry) in data.range::<String, _>((lower, Bound::Unbounded)).take(SCAN_CHUNK) {
                visit(entry);
                seen += 1;
                last = Some(key.clone());
            }
            drop(data);

            if seen < SCAN_CHUNK {
                return;
            }
            cursor = last;
        }
    }
}

fn nack(err: StorageError) -> Response {
    Response::Nack {
        fenced: err.is_write_fence(),
        reason: err.to_string(),
    }
}

/// Glob match over characters. `*` matches any run, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::SyncMode;

    fn open(dir: &std::path::Path) -> StorageNode {
        let config = NodeConfig {
            data_dir: dir.to_path_buf(),
            sync_mode: SyncMode::None,
            lock_stripes: 8,
        };
        StorageNode::open(NodeId(1), config).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());

        node.put("user:1", Bytes::from_static(b"alice"), None).unwrap();
        assert_eq!(node.get("user:1"), Some(Bytes::from_static(b"alice")));
        assert!(node.exists("user:1"));

        let tomb = node.delete("user:1").unwrap();
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.clock().get(NodeId(1)), 2);
        assert_eq!(node.get("user:1"), None);
        assert!(!node.exists("user:1"));
        assert!(node.entry("user:1").is_some_and(|e| e.is_tombstone()));
    }

    #[test]
    fn test_clock_advances_per_write() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());

        let first = node.put("k", Bytes::from_static(b"1"), None).unwrap();
        let second = node.put("k", Bytes::from_static(b"2"), None).unwrap();
        assert_eq!(second.clock().compare(first.clock()), ClockOrdering::After);
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());

        node.put("short", Bytes::from_static(b"v"), Some(Duration::from_millis(20))).unwrap();
        node.put("long", Bytes::from_static(b"v"), None).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(node.get("short"), None);
        assert_eq!(node.entry("short"), None);
        assert_eq!(node.keys("*"), vec!["long".to_string()]);
    }

    #[test]
    fn test_rewrite_after_expiry_supersedes_unread_replicas() {
        let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let stamper = open(da.path());
        let replica = StorageNode::open(NodeId(2), NodeConfig::new(db.path())).unwrap();

        let first = stamper.put("k", Bytes::from_static(b"v1"), Some(Duration::from_millis(20))).unwrap();
        replica.apply_replica(first.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        // Only the stamper has read the key since it expired.
        assert_eq!(stamper.get("k"), None);
        let second = stamper.put("k", Bytes::from_static(b"v2"), None).unwrap();
        assert_eq!(second.clock().compare(first.clock()), ClockOrdering::After);

        assert_eq!(replica.apply_replica(second).unwrap(), ApplyOutcome::Applied);
        assert_eq!(replica.get("k"), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn test_expired_version_loses_to_concurrent_write() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        let now = now_ms();

        let mut theirs = VectorClock::new();
        theirs.increment(NodeId(2));
        let expired = KvEntry::live("k", Bytes::from_static(b"old"), theirs, now - 100, Some(Duration::from_millis(10)));
        node.apply_replica(expired).unwrap();

        // Stamped elsewhere with a lagging wall clock.
        let mut ours = VectorClock::new();
        ours.increment(NodeId(3));
        let fresh = KvEntry::live("k", Bytes::from_static(b"new"), ours, now - 1_000, None);
        assert_eq!(node.apply_replica(fresh).unwrap(), ApplyOutcome::Applied);

        let stored = node.entry("k").unwrap();
        assert_eq!(stored.value(), Some(&Bytes::from_static(b"new")));
        assert_eq!((stored.clock().get(NodeId(2)), stored.clock().get(NodeId(3))), (1, 1));
    }

    #[test]
    fn test_merkle_tree_drops_entries_as_they_expire() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        node.put("short", Bytes::from_static(b"v"), Some(Duration::from_millis(30))).unwrap();
        let long = node.put("long", Bytes::from_static(b"v"), None).unwrap();

        let before = node.merkle_tree(&KeySpan::all(), 4).root();
        std::thread::sleep(Duration::from_millis(50));
        let after = node.merkle_tree(&KeySpan::all(), 4).root();

        assert_ne!(before, after);
        let expected = MerkleTree::build(4, [("long".to_string(), entry_digest(&long))]);
        assert_eq!(after, expected.root());
    }

    #[test]
    fn test_snapshot_refused_while_log_fenced() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        node.put("a", Bytes::from_static(b"1"), None).unwrap();
        node.wal().inject_sync_failure();
        assert!(node.put("b", Bytes::from_static(b"2"), None).is_err());

        assert!(node.snapshot().unwrap_err().is_write_fence());
        node.restore_log().unwrap();
        assert_eq!(node.snapshot().unwrap(), 1);
    }

    #[test]
    fn test_apply_replica_orders_by_clock() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        let local = node.put("k", Bytes::from_static(b"local"), None).unwrap();

        let stale = KvEntry::live("k", Bytes::from_static(b"old"), VectorClock::new(), 1, None);
        assert_eq!(node.apply_replica(stale).unwrap(), ApplyOutcome::Stale);

        let mut newer_clock = local.clock().clone();
        newer_clock.increment(NodeId(2));
        let newer = KvEntry::live("k", Bytes::from_static(b"newer"), newer_clock, 1, None);
        assert_eq!(node.apply_replica(newer).unwrap(), ApplyOutcome::Applied);
        assert_eq!(node.get("k"), Some(Bytes::from_static(b"newer")));
        assert_eq!(node.conflicts_resolved(), 0);
    }

    #[test]
    fn test_apply_replica_merges_concurrent_versions() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        let local = node.put("k", Bytes::from_static(b"local"), None).unwrap();

        let mut other = VectorClock::new();
        other.increment(NodeId(2));
        let remote = KvEntry::live("k", Bytes::from_static(b"remote"), other, local.timestamp_ms() + 1_000, None);

        assert_eq!(node.apply_replica(remote).unwrap(), ApplyOutcome::Merged);
        let stored = node.entry("k").unwrap();
        assert_eq!(stored.value(), Some(&Bytes::from_static(b"remote")));
        assert_eq!(stored.clock().get(NodeId(1)), 1);
        assert_eq!(stored.clock().get(NodeId(2)), 1);
        assert_eq!(node.conflicts_resolved(), 1);
    }

    #[test]
    fn test_outbox_receives_local_writes_only() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        let mut rx = node.attach_outbox();

        node.put("a", Bytes::from_static(b"1"), None).unwrap();
        let mut clock = VectorClock::new();
        clock.increment(NodeId(9));
        node.apply_replica(KvEntry::live("b", Bytes::from_static(b"2"), clock, 1, None))
            .unwrap();
        node.delete("a").unwrap();

        assert_eq!(rx.try_recv().unwrap().key(), "a");
        assert!(rx.try_recv().unwrap().is_tombstone());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_fence_after_log_failure() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        node.put("a", Bytes::from_static(b"1"), None).unwrap();

        node.wal().inject_sync_failure();
        assert!(node.put("b", Bytes::from_static(b"2"), None).is_err());
        let err = node.put("c", Bytes::from_static(b"3"), None).unwrap_err();
        assert!(err.is_write_fence());
        assert!(!node.is_writable());
        assert_eq!(node.get("a"), Some(Bytes::from_static(b"1")));
        assert_eq!(node.get("b"), None);

        match node.handle(Request::CoordinatePut {
            key: "d".into(),
            value: Bytes::from_static(b"4"),
            ttl_ms: 0,
        }) {
            Response::Nack { fenced, .. } => assert!(fenced),
            other => panic!("expected nack, got {other:?}"),
        }

        node.restore_log().unwrap();
        node.put("c", Bytes::from_static(b"3"), None).unwrap();
        assert_eq!(node.get("c"), Some(Bytes::from_static(b"3")));
    }

    #[test]
    fn test_merkle_tree_cache_tracks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        node.put("a", Bytes::from_static(b"1"), None).unwrap();

        let first = node.merkle_tree(&KeySpan::all(), 4);
        let again = node.merkle_tree(&KeySpan::all(), 4);
        assert!(Arc::ptr_eq(&first, &again));

        node.put("b", Bytes::from_static(b"2"), None).unwrap();
        let after = node.merkle_tree(&KeySpan::all(), 4);
        assert_ne!(first.root(), after.root());
    }

    #[test]
    fn test_keys_scan_crosses_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let node = open(dir.path());
        for i in 0..(SCAN_CHUNK * 2 + 7) {
            node.put(&format!("item:{i:04}"), Bytes::from_static(b"v"), None).unwrap();
        }
        node.put("other", Bytes::from_static(b"v"), None).unwrap();

        assert_eq!(node.keys("item:*").len(), SCAN_CHUNK * 2 + 7);
        assert_eq!(node.keys("item:000?").len(), 10);
        assert_eq!(node.len(), SCAN_CHUNK * 2 + 8);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("u?er:*:name", "user:1:name"));
        assert!(glob_match("*:name", "user:1:name"));
        assert!(!glob_match("user:*", "session:1"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }
}
