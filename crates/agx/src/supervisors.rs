//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "One supervisor dared to wire them all together."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor builds one [`Role`] per metric kind: channel groups, consumer loops
//! with their merge workers, one accumulator table per shard, and a persistence timer.
//! There are no globals. Whoever holds the `Supervisor` holds the config, and whoever
//! holds a `Role` holds its tasks.

mod role;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::aggregation::{AccumulatorTable, MergeWorker, SharedTable};
use crate::app_config::AppConfig;
use crate::backends::Storage;
use crate::channels::ChannelGroup;
use crate::consumers::MultiChannelConsumer;
use crate::merge::Metric;
use crate::persistence::{PersistenceTimer, TableFlusher};
use crate::worker_refs::{ClusterWorkerRef, LocalWorkerRef, Transport, WorkerRef};
use crate::workers::Worker;

pub use role::Role;

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?" every 20 milliseconds.
#[derive(Debug, Clone)]
pub struct Supervisor {
    /// 🔧 The sacred scrolls of configuration, passed down from main().
    app_config: AppConfig,
}

impl Supervisor {
    pub fn new(app_config: AppConfig) -> Result<Self> {
        app_config
            .runtime
            .validate()
            .context("💀 Supervisor refuses to start with this runtime config")?;
        Ok(Self { app_config })
    }

    /// 🧵 Build and start everything one metric kind needs on this node.
    ///
    /// Shard `i` gets channel group `i` and table `i`. Groups are dealt to consumer loops
    /// round robin, so a shard is always merged by the same task.
    pub fn start_role<M: Metric>(&self, storage: Arc<dyn Storage<M>>) -> Result<Role<M>> {
        let runtime = &self.app_config.runtime;
        let persistence = &self.app_config.persistence;

        let groups: Vec<Arc<ChannelGroup<M>>> = (0..runtime.shard_count)
            .map(|shard| {
                Arc::new(ChannelGroup::new(
                    format!("{}-{}", M::NAME, shard),
                    runtime.channels_per_group,
                    runtime.channel_capacity,
                    runtime.buffer_policy,
                    runtime.block_timeout(),
                ))
            })
            .collect();
        let tables: Vec<SharedTable<M>> = (0..runtime.shard_count)
            .map(|_| AccumulatorTable::shared())
            .collect();
        let local = LocalWorkerRef::new(groups.clone())
            .with_context(|| format!("💀 failed to build the local worker ref for {}", M::NAME))?;

        let (consumer_stop, consumer_stop_rx) = watch::channel(false);
        let loop_count = runtime.consumer_loops.min(runtime.shard_count);
        let mut loops: Vec<MultiChannelConsumer<M>> = (0..loop_count)
            .map(|i| {
                MultiChannelConsumer::new(
                    format!("{}-consumer-{}", M::NAME, i),
                    runtime.consume_cycle(),
                    runtime.priority,
                    consumer_stop_rx.clone(),
                )
            })
            .collect();
        for (shard, (group, table)) in groups.iter().zip(&tables).enumerate() {
            loops[shard % loop_count].add_group(
                Arc::clone(group),
                Box::new(MergeWorker::new(shard, Arc::clone(table))),
            );
        }
        let consumers = loops.into_iter().map(Worker::start).collect();

        let flusher = TableFlusher::new(
            tables.clone(),
            storage,
            persistence.accumulator_ttl(),
            persistence.max_accumulators,
        );
        let (timer_stop, timer_stop_rx) = watch::channel(false);
        let timer = PersistenceTimer::new(flusher.clone(), persistence.flush_period(), timer_stop_rx).start();

        info!(
            "🚀 role {} started: {} shards, {} consumer loops, flush every {:?}",
            M::NAME,
            runtime.shard_count,
            loop_count,
            persistence.flush_period()
        );
        Ok(Role::new(local, tables, flusher, consumer_stop, consumers, timer_stop, timer))
    }

    /// 🌐 A worker ref that forwards to `cluster.nodes` through `transport`.
    pub fn cluster_ref<M: Metric>(&self, transport: Arc<dyn Transport>) -> Result<WorkerRef<M>> {
        let nodes = self.app_config.cluster.nodes.clone();
        let cluster = ClusterWorkerRef::new(nodes, transport)
            .with_context(|| format!("💀 no cluster nodes configured for {}", M::NAME))?;
        Ok(WorkerRef::Cluster(cluster))
    }
}
