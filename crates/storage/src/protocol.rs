//! Node-to-node messages.
//!
//! Every exchange between the replication layer and a storage node is a
//! [`Request`] answered by a [`Response`]. Both travel as bincode frames so an
//! in-process replica exercises the same encoding a remote one would.

use bytes::Bytes;
use corelib::{Partitioner, Token, TokenRange};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entry::KvEntry;
use crate::error::StorageError;
use crate::merkle::Digest;

/// Portion of the keyspace an anti-entropy exchange covers. No ranges means
/// the whole ring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySpan {
    pub ranges: Vec<TokenRange>,
}

impl KeySpan {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(ranges: Vec<TokenRange>) -> Self {
        Self { ranges }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(token))
    }

    pub fn contains_key(&self, partitioner: &dyn Partitioner, key: &str) -> bool {
        self.ranges.is_empty() || self.contains(partitioner.token(key.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    /// Stamp a client write with this node's clock and persist it.
    CoordinatePut { key: String, value: Bytes, ttl_ms: u64 },
    /// Stamp and persist a tombstone.
    CoordinateDelete { key: String },
    /// Apply a version stamped elsewhere.
    ReplicatePut { entry: KvEntry },
    ReplicateGet { key: String },
    /// Deliver a write this node missed while it was unreachable.
    HintReplay { entry: KvEntry },
    /// Compare Merkle roots for `span`.
    AntiEntropySync { span: KeySpan, depth: u8, root: Digest },
    MerkleLevel {
        span: KeySpan,
        depth: u8,
        level: u8,
        positions: Vec<u32>,
    },
    BucketDigests {
        span: KeySpan,
        depth: u8,
        buckets: Vec<u32>,
    },
}

impl Request {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::CoordinatePut { .. } => "coordinate_put",
            Request::CoordinateDelete { .. } => "coordinate_delete",
            Request::ReplicatePut { .. } => "replicate_put",
            Request::ReplicateGet { .. } => "replicate_get",
            Request::HintReplay { .. } => "hint_replay",
            Request::AntiEntropySync { .. } => "anti_entropy_sync",
            Request::MerkleLevel { .. } => "merkle_level",
            Request::BucketDigests { .. } => "bucket_digests",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong { node: corelib::NodeId },
    Stamped { entry: KvEntry },
    Ack,
    /// The node could not apply the request. `fenced` is set when its log
    /// is unhealthy and it rejects every write until restored.
    Nack { reason: String, fenced: bool },
    Entry { entry: Option<KvEntry> },
    SyncMatch,
    SyncMismatch { root: Digest },
    Hashes { hashes: Vec<Digest> },
    Digests { digests: Vec<(String, Digest)> },
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::SipPartitioner;

    #[test]
    fn test_request_survives_codec() {
        let req = Request::MerkleLevel {
            span: KeySpan::new(vec![TokenRange::new(Token(10), Token(20))]),
            depth: 8,
            level: 3,
            positions: vec![1, 5],
        };
        let bytes = encode(&req).unwrap();
        assert_eq!(decode::<Request>(&bytes).unwrap(), req);
        assert_eq!(req.kind(), "merkle_level");
    }

    #[test]
    fn test_truncated_frame_is_codec_error() {
        let bytes = encode(&Request::ReplicateGet { key: "user:1".into() }).unwrap();
        let err = decode::<Request>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, StorageError::Codec(_)));
    }

    #[test]
    fn test_key_span_membership() {
        let partitioner = SipPartitioner;
        assert!(KeySpan::all().contains_key(&partitioner, "anything"));

        let token = partitioner.token(b"user:1");
        let around = KeySpan::new(vec![TokenRange::new(Token(token.0.wrapping_sub(1)), token)]);
        assert!(around.contains(token));
        assert!(around.contains_key(&partitioner, "user:1"));

        let elsewhere = KeySpan::new(vec![TokenRange::new(token, Token(token.0.wrapping_add(1)))]);
        assert!(!elsewhere.contains(token));
    }
}
