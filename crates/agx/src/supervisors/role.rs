use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregation::SharedTable;
use crate::merge::Metric;
use crate::persistence::{FlushReport, TableFlusher};
use crate::worker_refs::{LocalWorkerRef, RemoteReceiver, WorkerRef};

/// 🎭 Everything one metric kind runs on this node, and the only way to stop it.
///
/// Dropping a `Role` without calling [`Role::shutdown`] leaves its tasks running until
/// the runtime goes away, and nobody gets a final flush. Call `shutdown`.
pub struct Role<M> {
    local: LocalWorkerRef<M>,
    tables: Vec<SharedTable<M>>,
    flusher: TableFlusher<M>,
    consumer_stop: watch::Sender<bool>,
    consumers: Vec<JoinHandle<Result<()>>>,
    timer_stop: watch::Sender<bool>,
    timer: JoinHandle<Result<()>>,
}

impl<M: Metric> Role<M> {
    pub(super) fn new(
        local: LocalWorkerRef<M>,
        tables: Vec<SharedTable<M>>,
        flusher: TableFlusher<M>,
        consumer_stop: watch::Sender<bool>,
        consumers: Vec<JoinHandle<Result<()>>>,
        timer_stop: watch::Sender<bool>,
        timer: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            local,
            tables,
            flusher,
            consumer_stop,
            consumers,
            timer_stop,
            timer,
        }
    }

    /// 📨 A handle for producers. Clone it freely.
    pub fn worker_ref(&self) -> WorkerRef<M> {
        WorkerRef::Local(self.local.clone())
    }

    /// 📥 The receiving end for records other nodes forward here.
    pub fn remote_receiver(&self) -> RemoteReceiver<M> {
        RemoteReceiver::new(self.local.clone())
    }

    pub fn accepted(&self) -> u64 {
        self.local.groups().iter().map(|g| g.accepted()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.local.dropped()
    }

    /// 🔢 Accumulators currently held across every shard table.
    pub async fn accumulator_count(&self) -> usize {
        let mut count = 0;
        for table in &self.tables {
            count += table.lock().await.len();
        }
        count
    }

    /// 💾 Flush right now, outside the timer's schedule.
    pub async fn flush_now(&self) -> FlushReport {
        self.flusher.flush_once().await
    }

    /// 🛑 Stop in order: close the channels, let every consumer drain what is queued,
    /// then let the timer run its final flush. Returns every flush's tally added up.
    ///
    /// A consumer that panicked or failed does not cancel the final flush. The other
    /// shards still get persisted, and the first error comes back afterwards.
    pub async fn shutdown(self) -> Result<FlushReport> {
        let Self {
            local,
            flusher,
            consumer_stop,
            consumers,
            timer_stop,
            timer,
            ..
        } = self;
        info!("🛑 role {} shutting down", M::NAME);
        for group in local.groups() {
            group.close();
        }

        consumer_stop.send_replace(true);
        let mut first_failure: Option<anyhow::Error> = None;
        for joined in join_all(consumers).await {
            let outcome = joined
                .with_context(|| format!("💀 a {} consumer task panicked", M::NAME))
                .and_then(|result| result.with_context(|| format!("💀 a {} consumer task failed", M::NAME)));
            if let Err(err) = outcome {
                error!("{:#}", err);
                first_failure.get_or_insert(err);
            }
        }

        timer_stop.send_replace(true);
        timer
            .await
            .with_context(|| format!("💀 the {} persistence timer panicked", M::NAME))?
            .with_context(|| format!("💀 the {} persistence timer failed", M::NAME))?;
        let report = flusher.totals().await;
        if let Some(err) = first_failure {
            return Err(err);
        }
        info!("🏁 role {} stopped, {} dropped records, flushed {:?}", M::NAME, local.dropped(), report);
        Ok(report)
    }
}
