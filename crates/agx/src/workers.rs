//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! Two kinds live in this crate: the [`MultiChannelConsumer`](crate::consumers::MultiChannelConsumer)
//! loop that drains channel groups, and the [`PersistenceTimer`](crate::persistence::PersistenceTimer)
//! that flushes accumulators. Both are spawned onto tokio and both stop when their
//! `watch` shutdown signal flips to `true`. 🦆

use anyhow::Result;
use tokio::task::JoinHandle;

/// 🏗️ A background worker, that does work. duh.
pub trait Worker {
    /// 🚀 Spawn the worker. The handle resolves once the worker has finished its final pass.
    fn start(self) -> JoinHandle<Result<()>>;
}
