use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use crate::worker_refs::{NodeAddress, Transport};

/// 📮 One payload that went through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPayload {
    pub node: NodeAddress,
    pub shard: usize,
    pub payload: Vec<u8>,
}

/// 📡 A transport with no network: it writes down every forward and, if given a loopback,
/// hands the payload straight to the receiving side.
///
/// Point the loopback at a [`RemoteReceiver`](crate::worker_refs::RemoteReceiver) and you
/// have a two-node cluster in one process. No sockets were harmed.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    sent: Arc<Mutex<Vec<ForwardedPayload>>>,
    loopback: Option<Arc<dyn Transport>>,
    unreachable: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🔁 Deliver every forwarded payload to `receiver` after recording it.
    pub fn with_loopback(receiver: Arc<dyn Transport>) -> Self {
        Self {
            loopback: Some(receiver),
            ..Self::default()
        }
    }

    /// ✂️ Simulate a partition: every forward fails until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<ForwardedPayload> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn forward(&self, node: &NodeAddress, shard: usize, payload: Vec<u8>) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("📵 node {} is unreachable", node);
        }
        trace!("📮 forwarding {} bytes to {} (shard {})", payload.len(), node, shard);
        self.sent.lock().await.push(ForwardedPayload {
            node: node.clone(),
            shard,
            payload: payload.clone(),
        });
        if let Some(receiver) = &self.loopback {
            receiver.forward(node, shard, payload).await?;
        }
        Ok(())
    }
}
