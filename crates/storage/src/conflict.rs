//! Conflict resolution between two versions of the same key.
//!
//! Causally ordered versions never conflict: the dominating clock wins.
//! Concurrent versions are ranked by the node's [`ConflictPolicy`] and the
//! winner is re-stamped with the merge of both clocks, so it dominates every
//! version that fed into it. Ranking is total and symmetric, so every replica
//! that sees the same pair picks the same winner.

use std::cmp::Ordering;
use std::fmt;

use corelib::ClockOrdering;

use crate::entry::KvEntry;

/// Ranks two concurrent versions. `Ordering::Greater` means the left version
/// wins.
pub type RankFn = fn(&KvEntry, &KvEntry) -> Ordering;

#[derive(Clone, Copy, Default)]
pub enum ConflictPolicy {
    /// Latest wall-clock timestamp wins. Ties fall back to the larger value
    /// (tombstones rank lowest), then to the longer TTL.
    #[default]
    LastWriteWins,
    /// Caller-supplied ranking. Ties it leaves open are broken the same way
    /// as `LastWriteWins`.
    Custom(RankFn),
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LastWriteWins => f.write_str("LastWriteWins"),
            ConflictPolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl ConflictPolicy {
    pub fn rank(&self, a: &KvEntry, b: &KvEntry) -> Ordering {
        match self {
            ConflictPolicy::LastWriteWins => last_write_wins(a, b),
            ConflictPolicy::Custom(rank) => rank(a, b).then_with(|| last_write_wins(a, b)),
        }
    }
}

fn last_write_wins(a: &KvEntry, b: &KvEntry) -> Ordering {
    a.timestamp_ms()
        .cmp(&b.timestamp_ms())
        .then_with(|| a.value().cmp(&b.value()))
        .then_with(|| a.ttl_ms().cmp(&b.ttl_ms()))
}

/// Outcome of reconciling two versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: KvEntry,
    /// True when the versions were concurrent and the policy had to choose.
    pub conflict: bool,
}

pub fn reconcile(policy: &ConflictPolicy, a: &KvEntry, b: &KvEntry) -> Resolution {
    let pick = |ordering: Ordering| if ordering == Ordering::Less { b } else { a };

    match a.clock().compare(b.clock()) {
        ClockOrdering::After => Resolution {
            winner: a.clone(),
            conflict: false,
        },
        ClockOrdering::Before => Resolution {
            winner: b.clone(),
            conflict: false,
        },
        ClockOrdering::Equal => Resolution {
            winner: pick(policy.rank(a, b)).clone(),
            conflict: false,
        },
        ClockOrdering::Concurrent => {
            let merged = a.clock().merge(b.clock());
            Resolution {
                winner: pick(policy.rank(a, b)).clone().with_clock(merged),
                conflict: true,
            }
        }
    }
}
