//! How the coordinator reaches replicas.
//!
//! [`Replica`] is the seam between quorum logic and the wire. The only
//! implementation here, [`LocalReplica`], drives an in-process
//! [`StorageNode`] but still encodes every request and response so the
//! protocol is exercised end to end. It can be switched unreachable or slowed
//! down to simulate partitions and stragglers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corelib::NodeId;
use dashmap::{DashMap, DashSet};
use storage::protocol::{self, Request, Response};
use storage::StorageNode;

use crate::error::ReplicaError;

#[async_trait]
pub trait Replica: Send + Sync + 'static {
    fn id(&self) -> NodeId;

    /// Send one request and wait for its response. A `Nack` from the node
    /// surfaces as [`ReplicaError::Rejected`].
    async fn call(&self, request: Request) -> Result<Response, ReplicaError>;
}

/// Failure-detector view the replication layer consults before contacting a
/// node.
pub trait Liveness: Send + Sync + 'static {
    fn is_alive(&self, node: NodeId) -> bool;
}

/// Liveness driven by explicit up/down marks. Unmarked nodes are alive.
#[derive(Debug, Default)]
pub struct StaticLiveness {
    down: DashSet<NodeId>,
}

impl StaticLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_down(&self, node: NodeId) {
        self.down.insert(node);
    }

    pub fn mark_up(&self, node: NodeId) {
        self.down.remove(&node);
    }
}

impl Liveness for StaticLiveness {
    fn is_alive(&self, node: NodeId) -> bool {
        !self.down.contains(&node)
    }
}

/// Replica handles by node id, shared between the coordinator and the
/// background repair tasks.
#[derive(Default)]
pub struct Peers {
    replicas: DashMap<NodeId, Arc<dyn Replica>>,
}

impl std::fmt::Debug for Peers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peers").field("nodes", &self.ids()).finish()
    }
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, replica: Arc<dyn Replica>) {
        self.replicas.insert(replica.id(), replica);
    }

    pub fn remove(&self, node: &NodeId) -> Option<Arc<dyn Replica>> {
        self.replicas.remove(node).map(|(_, replica)| replica)
    }

    pub fn get(&self, node: &NodeId) -> Option<Arc<dyn Replica>> {
        self.replicas.get(node).map(|r| Arc::clone(r.value()))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.replicas.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

pub struct LocalReplica {
    node: Arc<StorageNode>,
    reachable: AtomicBool,
    delay_ms: AtomicU64,
}

impl std::fmt::Debug for LocalReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplica")
            .field("node", &self.node.id())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

impl LocalReplica {
    pub fn new(node: Arc<StorageNode>) -> Self {
        Self {
            node,
            reachable: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &Arc<StorageNode> {
        &self.node
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Cut the node off (or reconnect it). Requests to an unreachable node
    /// fail without touching its storage.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Delay every request by `delay` before it reaches the node.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Release);
    }
}

#[async_trait]
impl Replica for LocalReplica {
    fn id(&self) -> NodeId {
        self.node.id()
    }

    async fn call(&self, request: Request) -> Result<Response, ReplicaError> {
        let id = self.node.id();
        if !self.is_reachable() {
            return Err(ReplicaError::Unavailable(id));
        }
        let delay = self.delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let kind = request.kind();
        let frame = protocol::encode(&request)?;
        let node = Arc::clone(&self.node);
        let reply = tokio::task::spawn_blocking(move || {
            let request: Request = protocol::decode(&frame)?;
            protocol::encode(&node.handle(request))
        })
        .await
        .map_err(|err| ReplicaError::Rejected {
            node: id,
            reason: format!("{kind} handler panicked: {err}"),
            fenced: false,
        })??;

        match protocol::decode::<Response>(&reply)? {
            Response::Nack { reason, fenced } => Err(ReplicaError::Rejected {
                node: id,
                reason,
                fenced,
            }),
            response => Ok(response),
        }
    }
}
