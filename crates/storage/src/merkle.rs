//! Merkle trees over a node's keyspace.
//!
//! Keys are bucketed by the top bits of their blake3 hash, so two replicas
//! holding the same keys agree on bucket boundaries without coordination.
//! Leaves hash the sorted `(key, entry digest)` pairs of their bucket and
//! inner nodes hash their two children. Empty subtrees hash to all zeroes,
//! which keeps sparse trees cheap to compare.

use crate::entry::KvEntry;

pub type Digest = [u8; 32];

pub const EMPTY_DIGEST: Digest = [0u8; 32];
pub const DEFAULT_TREE_DEPTH: u8 = 8;
pub const MAX_TREE_DEPTH: u8 = 16;

/// Digest of everything that distinguishes one version from another.
pub fn entry_digest(entry: &KvEntry) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(entry.key().len() as u64).to_be_bytes());
    hasher.update(entry.key().as_bytes());
    match entry.value() {
        Some(value) => {
            hasher.update(&[1]);
            hasher.update(&(value.len() as u64).to_be_bytes());
            hasher.update(value);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&entry.ttl_ms().to_be_bytes());
    hasher.update(&entry.timestamp_ms().to_be_bytes());
    for (node, counter) in entry.clock().iter() {
        hasher.update(&node.0.to_be_bytes());
        hasher.update(&counter.to_be_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Leaf bucket of `key` in a tree of the given depth.
pub fn bucket_of(key: &str, depth: u8) -> u32 {
    if depth == 0 {
        return 0;
    }
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    let top = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    top >> (32 - u32::from(depth))
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    depth: u8,
    /// `levels[0]` is the root, `levels[depth]` the leaves.
    levels: Vec<Vec<Digest>>,
    buckets: Vec<Vec<(String, Digest)>>,
}

impl MerkleTree {
    /// Build from `(key, digest)` pairs. Pairs must arrive in key order so
    /// every bucket is sorted.
    pub fn build<I>(depth: u8, items: I) -> Self
    where
        I: IntoIterator<Item = (String, Digest)>,
    {
        let depth = depth.min(MAX_TREE_DEPTH);
        let width = 1usize << depth;
        let mut buckets: Vec<Vec<(String, Digest)>> = vec![Vec::new(); width];
        for (key, digest) in items {
            let bucket = bucket_of(&key, depth) as usize;
            buckets[bucket].push((key, digest));
        }

        let leaves: Vec<Digest> = buckets.iter().map(|bucket| leaf_hash(bucket)).collect();
        let mut levels = vec![leaves];
        while levels[0].len() > 1 {
            let parents = levels[0]
                .chunks(2)
                .map(|pair| inner_hash(&pair[0], &pair[1]))
                .collect();
            levels.insert(0, parents);
        }

        Self {
            depth,
            levels,
            buckets,
        }
    }

    pub fn from_entries<'a, I>(depth: u8, entries: I) -> Self
    where
        I: IntoIterator<Item = &'a KvEntry>,
    {
        Self::build(
            depth,
            entries
                .into_iter()
                .map(|entry| (entry.key().to_string(), entry_digest(entry))),
        )
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn root(&self) -> Digest {
        self.levels[0][0]
    }

    /// Hashes at `level` for each requested position. Positions outside the
    /// level read as empty.
    pub fn hashes_at(&self, level: u8, positions: &[u32]) -> Vec<Digest> {
        let Some(row) = self.levels.get(level as usize) else {
            return vec![EMPTY_DIGEST; positions.len()];
        };
        positions
            .iter()
            .map(|&pos| row.get(pos as usize).copied().unwrap_or(EMPTY_DIGEST))
            .collect()
    }

    /// Sorted `(key, digest)` pairs of the requested leaf buckets.
    pub fn bucket_digests(&self, buckets: &[u32]) -> Vec<(String, Digest)> {
        let mut out = Vec::new();
        for &bucket in buckets {
            if let Some(items) = self.buckets.get(bucket as usize) {
                out.extend(items.iter().cloned());
            }
        }
        out
    }

    /// Leaf buckets that differ from `other`. Both trees must share a depth.
    pub fn diff_leaves(&self, other: &MerkleTree) -> Vec<u32> {
        if self.depth != other.depth {
            return (0..(1u32 << self.depth)).collect();
        }
        let mut frontier = vec![0u32];
        for level in 0..=self.depth {
            let mine = self.hashes_at(level, &frontier);
            let theirs = other.hashes_at(level, &frontier);
            let differing: Vec<u32> = frontier
                .iter()
                .zip(mine.iter().zip(theirs.iter()))
                .filter(|(_, (a, b))| a != b)
                .map(|(&pos, _)| pos)
                .collect();
            if level == self.depth {
                return differing;
            }
            frontier = children_of(&differing);
        }
        Vec::new()
    }
}

/// Positions one level down from `positions`.
pub fn children_of(positions: &[u32]) -> Vec<u32> {
    positions.iter().flat_map(|&p| [p * 2, p * 2 + 1]).collect()
}

fn leaf_hash(bucket: &[(String, Digest)]) -> Digest {
    if bucket.is_empty() {
        return EMPTY_DIGEST;
    }
    let mut hasher = blake3::Hasher::new();
    for (key, digest) in bucket {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update(digest);
    }
    *hasher.finalize().as_bytes()
}

fn inner_hash(left: &Digest, right: &Digest) -> Digest {
    if left == &EMPTY_DIGEST && right == &EMPTY_DIGEST {
        return EMPTY_DIGEST;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corelib::{NodeId, VectorClock};

    fn entry(key: &str, value: &str) -> KvEntry {
        let mut clock = VectorClock::new();
        clock.increment(NodeId(1));
        KvEntry::live(key, Bytes::copy_from_slice(value.as_bytes()), clock, 100, None)
    }

    fn sorted(entries: &mut Vec<KvEntry>) -> &Vec<KvEntry> {
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries
    }

    #[test]
    fn test_empty_tree_root_is_zero() {
        let tree = MerkleTree::build(4, std::iter::empty());
        assert_eq!(tree.root(), EMPTY_DIGEST);
        assert_eq!(tree.depth(), 4);
    }

    #[test]
    fn test_same_contents_same_root() {
        let mut a: Vec<KvEntry> = (0..50).map(|i| entry(&format!("k{i}"), "v")).collect();
        let mut b = a.clone();
        b.reverse();

        let left = MerkleTree::from_entries(6, sorted(&mut a));
        let right = MerkleTree::from_entries(6, sorted(&mut b));
        assert_eq!(left.root(), right.root());
        assert!(left.diff_leaves(&right).is_empty());
    }

    #[test]
    fn test_diff_finds_changed_bucket() {
        let mut a: Vec<KvEntry> = (0..50).map(|i| entry(&format!("k{i}"), "v")).collect();
        let mut b = a.clone();
        b[17] = entry("k17", "changed");

        let left = MerkleTree::from_entries(6, sorted(&mut a));
        let right = MerkleTree::from_entries(6, sorted(&mut b));
        assert_ne!(left.root(), right.root());
        assert_eq!(left.diff_leaves(&right), vec![bucket_of("k17", 6)]);

        let keys: Vec<String> = left
            .bucket_digests(&[bucket_of("k17", 6)])
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert!(keys.contains(&"k17".to_string()));
    }

    #[test]
    fn test_digest_covers_clock_and_tombstone() {
        let live = entry("k", "v");
        let mut bumped = live.clock().clone();
        bumped.increment(NodeId(2));
        assert_ne!(entry_digest(&live), entry_digest(&live.clone().with_clock(bumped)));

        let tomb = KvEntry::tombstone("k", live.clock().clone(), 100);
        let empty = KvEntry::live("k", Bytes::new(), live.clock().clone(), 100, None);
        assert_ne!(entry_digest(&tomb), entry_digest(&empty));
    }

    #[test]
    fn test_bucket_of_stays_in_range() {
        for depth in [0u8, 1, 8, 16] {
            for i in 0..200 {
                assert!(bucket_of(&format!("key-{i}"), depth) < (1u32 << depth));
            }
        }
    }
}
