//! 💾 Persistence: the timer that moves dirty accumulators into storage.
//!
//! 🎬 *[every 25 seconds, like clockwork, the timer wakes up, takes everything dirty off
//! the tables, and goes to have an awkward conversation with the database.]*
//!
//! A flush, per table:
//! 1. 🔒 Lock, take the unflushed portion of every dirty accumulator, unlock.
//! 2. 🔎 Per key: `get`. Absent → `insert`. Present → reconcile and `update`
//!    (insert-only kinds skip the update).
//! 3. 💥 A key whose storage call fails is logged, its portion restored, and it stays
//!    dirty for the next tick. The other keys carry on.
//! 4. 🧹 Evict idle clean accumulators.
//!
//! The table lock is never held across storage I/O, so consumers keep merging while the
//! database takes its time. Flushes themselves never overlap: the timer and
//! [`TableFlusher::flush_once`] callers take turns on one flush guard, otherwise two of
//! them would read the same persisted row and the second `update` would erase the first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::aggregation::{PendingFlush, SharedTable};
use crate::backends::Storage;
use crate::merge::Metric;
use crate::workers::Worker;

/// 🧾 Tally of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    /// Rows that already existed for an insert-only kind.
    pub skipped: usize,
    pub failed: usize,
    pub evicted: usize,
}

impl FlushReport {
    pub fn absorb(&mut self, other: FlushReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.evicted += other.evicted;
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

enum WriteOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// 🚿 The flush itself, without the clock. Cheap to clone; the timer owns one and a
/// role keeps another for on-demand flushes.
#[derive(Debug)]
pub struct TableFlusher<M> {
    tables: Vec<SharedTable<M>>,
    storage: Arc<dyn Storage<M>>,
    idle_ttl: Duration,
    max_accumulators: usize,
    // 🚦 shared by every clone, held for a whole flush
    flush_guard: Arc<Mutex<()>>,
    // 🧮 every flush since start, added up
    totals: Arc<Mutex<FlushReport>>,
}

impl<M> Clone for TableFlusher<M> {
    fn clone(&self) -> Self {
        Self {
            tables: self.tables.clone(),
            storage: Arc::clone(&self.storage),
            idle_ttl: self.idle_ttl,
            max_accumulators: self.max_accumulators,
            flush_guard: Arc::clone(&self.flush_guard),
            totals: Arc::clone(&self.totals),
        }
    }
}

impl<M: Metric> TableFlusher<M> {
    /// 🏗️ `max_accumulators` caps each table, not the sum of them.
    pub fn new(
        tables: Vec<SharedTable<M>>,
        storage: Arc<dyn Storage<M>>,
        idle_ttl: Duration,
        max_accumulators: usize,
    ) -> Self {
        Self {
            tables,
            storage,
            idle_ttl,
            max_accumulators,
            flush_guard: Arc::new(Mutex::new(())),
            totals: Arc::new(Mutex::new(FlushReport::default())),
        }
    }

    /// 💾 One pass over every table. Waits for any flush already in progress.
    pub async fn flush_once(&self) -> FlushReport {
        let _turn = self.flush_guard.lock().await;
        let mut report = FlushReport::default();
        for (shard, table) in self.tables.iter().enumerate() {
            report.absorb(self.flush_table(shard, table).await);
        }
        self.totals.lock().await.absorb(report);
        report
    }

    /// 📈 Sum of every flush this flusher (or any clone of it) has run.
    pub async fn totals(&self) -> FlushReport {
        *self.totals.lock().await
    }

    async fn flush_table(&self, shard: usize, table: &SharedTable<M>) -> FlushReport {
        let mut report = FlushReport::default();
        let pending = table.lock().await.take_dirty();

        let mut failed = Vec::new();
        for item in pending {
            match self.write(&item).await {
                Ok(WriteOutcome::Inserted) => report.inserted += 1,
                Ok(WriteOutcome::Updated) => report.updated += 1,
                Ok(WriteOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    warn!("💀 {} shard {}: flush failed, will retry: {:#}", M::NAME, shard, err);
                    failed.push(item);
                }
            }
        }
        report.failed = failed.len();

        let mut table = table.lock().await;
        for item in failed {
            table.restore(item);
        }
        report.evicted = table.evict(Instant::now(), self.idle_ttl, self.max_accumulators);
        report
    }

    async fn write(&self, item: &PendingFlush<M>) -> Result<WriteOutcome> {
        let persisted = self
            .storage
            .get(&item.key)
            .await
            .with_context(|| format!("failed to read '{}'", item.key))?;
        match persisted {
            None => {
                self.storage
                    .insert(&item.delta)
                    .await
                    .with_context(|| format!("failed to insert '{}'", item.key))?;
                Ok(WriteOutcome::Inserted)
            }
            Some(_) if !M::SUPPORTS_UPDATE => Ok(WriteOutcome::Skipped),
            Some(persisted) => {
                let merged = item.delta.reconcile(&persisted);
                self.storage
                    .update(&item.key, &merged)
                    .await
                    .with_context(|| format!("failed to update '{}'", item.key))?;
                Ok(WriteOutcome::Updated)
            }
        }
    }
}

/// ⏰ Runs [`TableFlusher::flush_once`] every `flush_period` (fixed delay: a slow flush
/// pushes the next one back instead of bunching them up), then once more on shutdown.
pub struct PersistenceTimer<M> {
    flusher: TableFlusher<M>,
    flush_period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<M: Metric> PersistenceTimer<M> {
    pub fn new(flusher: TableFlusher<M>, flush_period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            flusher,
            // 🛑 a zero period makes tokio's interval panic
            flush_period: flush_period.max(Duration::from_millis(1)),
            shutdown,
        }
    }
}

impl<M: Metric> Worker for PersistenceTimer<M> {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!("⏰ {} persistence timer started, every {:?}", M::NAME, self.flush_period);
            let mut ticker = interval_at(Instant::now() + self.flush_period, self.flush_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !*self.shutdown.borrow() {
                // Some(still_connected) when the shutdown channel woke us up
                let woke_for_shutdown = tokio::select! {
                    _ = ticker.tick() => None,
                    changed = self.shutdown.changed() => Some(changed.is_ok()),
                };
                match woke_for_shutdown {
                    None => {
                        let report = self.flusher.flush_once().await;
                        debug!("💾 {} flush wrote {} rows: {:?}", M::NAME, report.written(), report);
                    }
                    Some(true) => continue,
                    Some(false) => break,
                }
            }

            let report = self.flusher.flush_once().await;
            info!(
                "🏁 {} persistence timer stopped after a final flush of {} rows: {:?}",
                M::NAME,
                report.written(),
                report
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AccumulatorTable;
    use crate::backends::InMemoryStorage;
    use crate::metrics::{JvmMemory, ServiceCalls, ServiceTraffic};

    fn calls(n: i64) -> ServiceCalls {
        ServiceCalls {
            service_id: "A".into(),
            time_bucket: 100,
            calls: n,
            duration_sum_ms: 10 * n,
            errors: 0,
        }
    }

    fn rig<M: Metric>() -> (SharedTable<M>, InMemoryStorage<M>, TableFlusher<M>) {
        let table = AccumulatorTable::shared();
        let storage = InMemoryStorage::new();
        let flusher = TableFlusher::new(
            vec![table.clone()],
            Arc::new(storage.clone()),
            Duration::from_secs(70),
            1_000,
        );
        (table, storage, flusher)
    }

    async fn merge<M: Metric>(table: &SharedTable<M>, record: M) {
        let key = record.aggregation_key();
        table.lock().await.merge(&key, &record, Instant::now());
    }

    #[tokio::test]
    async fn the_one_where_three_calls_survive_the_round_trip_to_storage() {
        let (table, storage, flusher) = rig();
        for _ in 0..3 {
            merge(&table, calls(1)).await;
        }

        let report = flusher.flush_once().await;
        assert_eq!(report.inserted, 1);
        assert_eq!(storage.get_row("A_100").await.unwrap().calls, 3);

        assert_eq!(flusher.flush_once().await, FlushReport::default(), "nothing new, nothing written");
        assert_eq!(storage.get_row("A_100").await.unwrap().calls, 3);

        merge(&table, calls(2)).await;
        let report = flusher.flush_once().await;
        assert_eq!(report.updated, 1);
        let row = storage.get_row("A_100").await.unwrap();
        assert_eq!(row.calls, 5);
        assert_eq!(row.duration_sum_ms, 50);
    }

    #[tokio::test]
    async fn the_one_where_a_running_total_is_not_counted_twice() {
        let (table, storage, flusher) = rig::<JvmMemory>();
        let mut sample = JvmMemory {
            instance_id: "jvm-1".into(),
            time_bucket: 7,
            heap_used: 10.0,
            heap_max: 64.0,
            gc_count: 5,
        };
        merge(&table, sample.clone()).await;
        flusher.flush_once().await;

        sample.heap_used = 30.0;
        sample.gc_count = 2;
        merge(&table, sample).await;
        flusher.flush_once().await;
        flusher.flush_once().await;

        let row = storage.get_row("jvm-1_7").await.unwrap();
        assert_eq!(row.gc_count, 7);
        assert_eq!(row.heap_used, 30.0);
        assert_eq!(table.lock().await.get("jvm-1_7").unwrap().row().gc_count, 7);
    }

    #[tokio::test]
    async fn the_one_where_a_failed_write_is_retried_without_double_counting() {
        let (table, storage, flusher) = rig();
        merge(&table, calls(4)).await;

        storage.set_failing(true);
        let report = flusher.flush_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(table.lock().await.dirty_count(), 1, "failed keys stay dirty");

        merge(&table, calls(1)).await;
        storage.set_failing(false);
        let report = flusher.flush_once().await;
        assert_eq!((report.inserted, report.failed), (1, 0));
        assert_eq!(storage.get_row("A_100").await.unwrap().calls, 5);
    }

    #[tokio::test]
    async fn the_one_where_insert_only_kinds_keep_the_first_row() {
        let (table, storage, flusher) = rig();
        let traffic = |name: &str| ServiceTraffic {
            service_id: "svc".into(),
            time_bucket: 1,
            name: name.into(),
            layer: "GENERAL".into(),
        };
        merge(&table, traffic("first")).await;
        flusher.flush_once().await;
        merge(&table, traffic("second")).await;

        let report = flusher.flush_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(storage.get_row("svc_1").await.unwrap().name, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_idle_rows_are_evicted_after_they_are_flushed() {
        let (table, _storage, flusher) = rig();
        merge(&table, calls(1)).await;
        assert_eq!(flusher.flush_once().await.evicted, 0, "just flushed is not idle");

        tokio::time::advance(Duration::from_secs(71)).await;
        assert_eq!(flusher.flush_once().await.evicted, 1);
        assert!(table.lock().await.is_empty());
    }

    /// 🐌 Storage whose reads take a while, so two flushes get a chance to overlap.
    #[derive(Debug, Clone)]
    struct SlowReads {
        inner: InMemoryStorage<ServiceCalls>,
    }

    #[async_trait::async_trait]
    impl Storage<ServiceCalls> for SlowReads {
        async fn get(&self, key: &str) -> Result<Option<ServiceCalls>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.get(key).await
        }

        async fn insert(&self, row: &ServiceCalls) -> Result<()> {
            self.inner.insert(row).await
        }

        async fn update(&self, key: &str, row: &ServiceCalls) -> Result<()> {
            self.inner.update(key, row).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_an_on_demand_flush_waits_for_the_one_in_flight() {
        let table = AccumulatorTable::shared();
        let storage = InMemoryStorage::new();
        storage.insert(&calls(1)).await.unwrap();
        let flusher = TableFlusher::new(
            vec![table.clone()],
            Arc::new(SlowReads { inner: storage.clone() }),
            Duration::from_secs(70),
            1_000,
        );

        merge(&table, calls(10)).await;
        let first = {
            let flusher = flusher.clone();
            tokio::spawn(async move { flusher.flush_once().await })
        };
        // 🐢 let the first flush take its delta and park inside the slow read
        while table.lock().await.dirty_count() > 0 {
            tokio::task::yield_now().await;
        }

        merge(&table, calls(100)).await;
        let second = flusher.flush_once().await;
        let first = first.await.unwrap();

        assert_eq!((first.updated, second.updated), (1, 1));
        assert_eq!(table.lock().await.dirty_count(), 0);
        assert_eq!(storage.get_row("A_100").await.unwrap().calls, 111, "both deltas land");
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_timer_ticks_and_then_flushes_one_last_time() {
        let (table, storage, flusher) = rig();
        let (tx, rx) = watch::channel(false);
        let handle = PersistenceTimer::new(flusher, Duration::from_secs(25), rx).start();

        merge(&table, calls(1)).await;
        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(storage.get_row("A_100").await.map(|r| r.calls), Some(1));

        merge(&table, calls(2)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(storage.get_row("A_100").await.unwrap().calls, 3, "final flush on shutdown");
    }
}
