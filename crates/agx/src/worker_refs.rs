//! 📨 Worker references: the handle a producer calls, without caring where the shard lives.
//!
//! 🎬 *[a span arrives. it does not know which node owns `A_100`. it does not need to.
//! it calls `dispatch`. somebody, somewhere, deals with it.]*
//!
//! - 🏠 [`WorkerRef::Local`] routes the record to one of this node's channel groups and
//!   offers it. A full channel is an answer ([`Dispatch::Dropped`]), not an error.
//! - 🌐 [`WorkerRef::Cluster`] serializes the record to JSON and forwards it through a
//!   [`Transport`] to the node owning the shard. Transport errors come back to the caller
//!   with context and are not retried here.
//! - 📥 [`RemoteReceiver`] is the far end: decode, then dispatch locally.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::channels::ChannelGroup;
use crate::merge::Metric;
use crate::routing::Router;

/// 🗺️ Where a cluster peer listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 🚚 Ships an encoded record to the node that owns `shard`. Retries, if any, are the
/// transport's business.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn forward(&self, node: &NodeAddress, shard: usize, payload: Vec<u8>) -> Result<()>;
}

/// 🧾 What happened to a dispatched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sitting in a local channel, waiting for its consumer.
    Enqueued,
    /// The channel was full (or closed) and the record is gone.
    Dropped,
    /// Handed to the transport for a remote node.
    Forwarded,
}

/// 🏠 Routes into this node's channel groups.
#[derive(Debug)]
pub struct LocalWorkerRef<M> {
    router: Router,
    groups: Arc<[Arc<ChannelGroup<M>>]>,
}

impl<M> Clone for LocalWorkerRef<M> {
    fn clone(&self) -> Self {
        Self {
            router: self.router,
            groups: Arc::clone(&self.groups),
        }
    }
}

impl<M: Metric> LocalWorkerRef<M> {
    /// 🏗️ One group per shard; the router is sized to match.
    pub fn new(groups: Vec<Arc<ChannelGroup<M>>>) -> Result<Self> {
        let router = Router::new(groups.len()).context("a local worker ref needs at least one channel group")?;
        Ok(Self {
            router,
            groups: groups.into(),
        })
    }

    pub async fn dispatch(&self, record: M) -> Dispatch {
        let key = record.aggregation_key();
        let shard = self.router.route(&key);
        let group = &self.groups[shard];
        if group.offer(record).await {
            Dispatch::Enqueued
        } else {
            // 📉 drops surface through `dropped()`, not the log
            trace!("🗑️ {} record '{}' dropped, group '{}' is full", M::NAME, key, group.name());
            Dispatch::Dropped
        }
    }

    pub fn groups(&self) -> &[Arc<ChannelGroup<M>>] {
        &self.groups
    }

    pub fn router(&self) -> Router {
        self.router
    }

    /// 📉 Records dropped across every group since start.
    pub fn dropped(&self) -> u64 {
        self.groups.iter().map(|g| g.dropped()).sum()
    }
}

/// 🌐 Forwards to whichever node owns the record's shard.
#[derive(Debug)]
pub struct ClusterWorkerRef<M> {
    router: Router,
    nodes: Arc<[NodeAddress]>,
    transport: Arc<dyn Transport>,
    _kind: PhantomData<fn(M)>,
}

impl<M> Clone for ClusterWorkerRef<M> {
    fn clone(&self) -> Self {
        Self {
            router: self.router,
            nodes: Arc::clone(&self.nodes),
            transport: Arc::clone(&self.transport),
            _kind: PhantomData,
        }
    }
}

impl<M: Metric> ClusterWorkerRef<M> {
    /// 🏗️ Shard `i` is owned by `nodes[i]`.
    pub fn new(nodes: Vec<NodeAddress>, transport: Arc<dyn Transport>) -> Result<Self> {
        if nodes.is_empty() {
            bail!("💀 a cluster worker ref for {} needs at least one node", M::NAME);
        }
        let router = Router::new(nodes.len())?;
        Ok(Self {
            router,
            nodes: nodes.into(),
            transport,
            _kind: PhantomData,
        })
    }

    pub async fn dispatch(&self, record: M) -> Result<Dispatch> {
        let key = record.aggregation_key();
        let shard = self.router.route(&key);
        let node = &self.nodes[shard];
        let payload = serde_json::to_vec(&record)
            .with_context(|| format!("failed to encode {} record '{}'", M::NAME, key))?;
        self.transport
            .forward(node, shard, payload)
            .await
            .with_context(|| format!("failed to forward {} record '{}' to {}", M::NAME, key, node))?;
        Ok(Dispatch::Forwarded)
    }

    pub fn node_for(&self, key: &str) -> &NodeAddress {
        &self.nodes[self.router.route(key)]
    }
}

/// 📨 The one handle producers hold.
#[derive(Debug)]
pub enum WorkerRef<M> {
    Local(LocalWorkerRef<M>),
    Cluster(ClusterWorkerRef<M>),
}

impl<M> Clone for WorkerRef<M> {
    fn clone(&self) -> Self {
        match self {
            WorkerRef::Local(local) => WorkerRef::Local(local.clone()),
            WorkerRef::Cluster(cluster) => WorkerRef::Cluster(cluster.clone()),
        }
    }
}

impl<M: Metric> WorkerRef<M> {
    /// 🚀 Fire and forget. `Err` only ever comes from the cluster transport.
    pub async fn dispatch(&self, record: M) -> Result<Dispatch> {
        match self {
            WorkerRef::Local(local) => Ok(local.dispatch(record).await),
            WorkerRef::Cluster(cluster) => cluster.dispatch(record).await,
        }
    }
}

/// 📥 The receiving end of cluster dispatch: decode and hand to the local ref.
#[derive(Debug)]
pub struct RemoteReceiver<M> {
    local: LocalWorkerRef<M>,
}

impl<M> Clone for RemoteReceiver<M> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
        }
    }
}

impl<M: Metric> RemoteReceiver<M> {
    pub fn new(local: LocalWorkerRef<M>) -> Self {
        Self { local }
    }

    pub async fn receive(&self, shard: usize, payload: &[u8]) -> Result<Dispatch> {
        let record: M = serde_json::from_slice(payload).with_context(|| {
            format!("failed to decode a forwarded {} record for shard {}", M::NAME, shard)
        })?;
        debug!("📥 received {} record for shard {}", M::NAME, shard);
        Ok(self.local.dispatch(record).await)
    }
}

// 🔁 a receiver can sit at the far end of any transport, which is how loopback tests work
#[async_trait]
impl<M: Metric> Transport for RemoteReceiver<M> {
    async fn forward(&self, _node: &NodeAddress, shard: usize, payload: Vec<u8>) -> Result<()> {
        self.receive(shard, &payload).await.map(|_| ())
    }
}
