//! Stored entry format.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use corelib::VectorClock;
use serde::{Deserialize, Serialize};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A versioned value held by one replica.
///
/// A missing value marks a tombstone. The expiry instant is derived from the
/// write timestamp and TTL rather than stored, so `expires_at_ms()` is `None`
/// exactly when the TTL is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    key: String,
    value: Option<Bytes>,
    clock: VectorClock,
    timestamp_ms: u64,
    ttl_ms: u64,
}

impl KvEntry {
    pub fn live(
        key: impl Into<String>,
        value: Bytes,
        clock: VectorClock,
        timestamp_ms: u64,
        ttl: Option<Duration>,
    ) -> Self {
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0);
        Self::from_parts(key.into(), Some(value), clock, timestamp_ms, ttl_ms)
    }

    pub fn tombstone(key: impl Into<String>, clock: VectorClock, timestamp_ms: u64) -> Self {
        Self::from_parts(key.into(), None, clock, timestamp_ms, 0)
    }

    pub(crate) fn from_parts(
        key: String,
        value: Option<Bytes>,
        clock: VectorClock,
        timestamp_ms: u64,
        ttl_ms: u64,
    ) -> Self {
        Self {
            key,
            value,
            clock,
            timestamp_ms,
            ttl_ms,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value, `None` for a tombstone.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn expires_at_ms(&self) -> Option<u64> {
        (self.ttl_ms > 0).then(|| self.timestamp_ms.saturating_add(self.ttl_ms))
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms().is_some_and(|at| now_ms >= at)
    }

    /// Value visible to clients at `now_ms`.
    pub fn live_value_at(&self, now_ms: u64) -> Option<&Bytes> {
        if self.is_expired_at(now_ms) {
            None
        } else {
            self.value.as_ref()
        }
    }

    /// What stays behind once an expired entry is dropped: no value, but
    /// the same clock, so the next local write still counts past it.
    pub(crate) fn expired_remnant(&self) -> KvEntry {
        Self::from_parts(self.key.clone(), None, self.clock.clone(), self.timestamp_ms, self.ttl_ms)
    }

    /// Same write carrying a different causal history.
    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.clock = clock;
        self
    }
}
