//! 🧺 Aggregation: one accumulator per key, one table per (role, shard).
//!
//! 🎬 *[INT. HASHMAP. a key is born. it is `A_100`. it is dirty from the moment it
//! arrives. the persistence timer will clean it. the next span will dirty it again.
//! this is the circle of life.]*
//!
//! Per-key lifecycle: `Absent → Active → (flushed, still Active with cleared deltas | evicted)`.
//!
//! The [`MergeWorker`] runs inside the consumer task that owns its shard, so a table only
//! ever has two visitors: that consumer and the persistence timer. The `tokio` mutex
//! around the table is there for the timer's short take/restore/evict windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::consumers::GroupConsumer;
use crate::merge::Metric;

/// 🔒 A table shared by one consumer and the persistence timer.
pub type SharedTable<M> = Arc<Mutex<AccumulatorTable<M>>>;

/// 📒 The in-memory row for one aggregation key.
#[derive(Debug, Clone)]
pub struct Accumulator<M> {
    row: M,
    // 📏 what storage already has for running_total columns
    baseline: M,
    dirty: bool,
    last_touched: Instant,
}

impl<M: Metric> Accumulator<M> {
    fn seed(record: M, now: Instant) -> Self {
        let baseline = record.zeroed_baseline();
        Self {
            row: record,
            baseline,
            dirty: true,
            last_touched: now,
        }
    }

    pub fn row(&self) -> &M {
        &self.row
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }
}

/// 📤 What the persistence timer took out of one accumulator.
#[derive(Debug, Clone)]
pub struct PendingFlush<M> {
    pub key: String,
    pub delta: M,
}

#[derive(Debug)]
pub struct AccumulatorTable<M> {
    accumulators: HashMap<String, Accumulator<M>>,
}

impl<M: Metric> Default for AccumulatorTable<M> {
    fn default() -> Self {
        Self {
            accumulators: HashMap::new(),
        }
    }
}

impl<M: Metric> AccumulatorTable<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTable<M> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// ➕ Fold `record` into the accumulator for `key`, creating it if absent.
    pub fn merge(&mut self, key: &str, record: &M, now: Instant) {
        match self.accumulators.get_mut(key) {
            Some(acc) => {
                acc.row.combine(record);
                acc.dirty = true;
                acc.last_touched = now;
            }
            None => {
                self.accumulators
                    .insert(key.to_string(), Accumulator::seed(record.clone(), now));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Accumulator<M>> {
        self.accumulators.get(key)
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.accumulators.values().filter(|acc| acc.dirty).count()
    }

    /// 📤 Take the unflushed portion of every dirty accumulator and mark it clean.
    pub fn take_dirty(&mut self) -> Vec<PendingFlush<M>> {
        self.accumulators
            .iter_mut()
            .filter(|(_, acc)| acc.dirty)
            .map(|(key, acc)| {
                acc.dirty = false;
                PendingFlush {
                    key: key.clone(),
                    delta: acc.row.take_unflushed(&mut acc.baseline),
                }
            })
            .collect()
    }

    /// ↩️ Put back a portion whose write failed and mark the key dirty again.
    pub fn restore(&mut self, pending: PendingFlush<M>) {
        match self.accumulators.get_mut(&pending.key) {
            Some(acc) => {
                acc.row.restore_unflushed(&mut acc.baseline, &pending.delta);
                acc.dirty = true;
            }
            None => {
                // gone in between; the taken portion becomes a fresh accumulator
                let now = Instant::now();
                self.accumulators
                    .insert(pending.key, Accumulator::seed(pending.delta, now));
            }
        }
    }

    /// 🧹 Drop clean accumulators idle longer than `idle_ttl`, then the oldest clean ones
    /// while the table holds more than `max_entries`. Dirty accumulators always stay.
    pub fn evict(&mut self, now: Instant, idle_ttl: Duration, max_entries: usize) -> usize {
        let before = self.accumulators.len();
        self.accumulators
            .retain(|_, acc| acc.dirty || now.saturating_duration_since(acc.last_touched) <= idle_ttl);

        if self.accumulators.len() > max_entries {
            let mut clean: Vec<(Instant, String)> = self
                .accumulators
                .iter()
                .filter(|(_, acc)| !acc.dirty)
                .map(|(key, acc)| (acc.last_touched, key.clone()))
                .collect();
            clean.sort_unstable();
            let excess = self.accumulators.len() - max_entries;
            for (_, key) in clean.into_iter().take(excess) {
                self.accumulators.remove(&key);
            }
        }
        before - self.accumulators.len()
    }
}

/// 🍽️ The group consumer that folds batches into one shard's table.
#[derive(Debug)]
pub struct MergeWorker<M> {
    shard: usize,
    table: SharedTable<M>,
}

impl<M: Metric> MergeWorker<M> {
    pub fn new(shard: usize, table: SharedTable<M>) -> Self {
        Self { shard, table }
    }
}

#[async_trait]
impl<M: Metric> GroupConsumer<M> for MergeWorker<M> {
    async fn consume(&mut self, batch: &[M]) -> Result<()> {
        let now = Instant::now();
        let mut keyless = 0usize;
        {
            let mut table = self.table.lock().await;
            for record in batch {
                let key = record.aggregation_key();
                if key.is_empty() {
                    keyless += 1;
                    continue;
                }
                table.merge(&key, record, now);
            }
        }
        debug!(
            "🧮 {} shard {} merged {} records",
            M::NAME,
            self.shard,
            batch.len() - keyless
        );
        if keyless > 0 {
            bail!("{} of {} records had an empty aggregation key", keyless, batch.len());
        }
        Ok(())
    }

    async fn on_error(&mut self, batch: &[M], err: anyhow::Error) {
        warn!(
            "💀 {} shard {} rejected part of a {}-record batch: {:#}",
            M::NAME,
            self.shard,
            batch.len(),
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Mergeable;
    use serde::{Deserialize, Serialize};

    crate::metric_row! {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Sample {
            #[merge(identity)]
            entity: String,
            #[merge(identity)]
            bucket: i64,
            #[merge(accumulate)]
            calls: i64,
            #[merge(replace)]
            usage: f64,
            #[merge(accumulate, running_total)]
            total: i64,
        }
    }

    impl Metric for Sample {
        const NAME: &'static str = "sample";

        fn aggregation_key(&self) -> String {
            if self.entity.is_empty() {
                return String::new();
            }
            format!("{}_{}", self.entity, self.bucket)
        }
    }

    fn sample(entity: &str, bucket: i64, calls: i64, usage: f64) -> Sample {
        Sample {
            entity: entity.to_string(),
            bucket,
            calls,
            usage,
            total: calls,
        }
    }

    async fn merged(batches: Vec<Vec<Sample>>) -> SharedTable<Sample> {
        let table = AccumulatorTable::shared();
        let mut worker = MergeWorker::new(0, table.clone());
        for batch in batches {
            let _ = worker.consume(&batch).await;
        }
        table
    }

    #[tokio::test]
    async fn the_one_where_three_calls_become_calls_three() {
        let table = merged(vec![
            vec![sample("A", 100, 1, 0.0), sample("A", 100, 1, 0.0)],
            vec![sample("A", 100, 1, 0.0)],
        ])
        .await;
        let table = table.lock().await;
        let acc = table.get("A_100").unwrap();
        assert_eq!(acc.row().calls, 3);
        assert!(acc.is_dirty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_the_latest_usage_wins() {
        let table = merged(vec![vec![sample("B", 5, 0, 10.0)], vec![sample("B", 5, 0, 30.0)]]).await;
        assert_eq!(table.lock().await.get("B_5").unwrap().row().usage, 30.0);
    }

    #[tokio::test]
    async fn the_one_where_batching_and_order_do_not_change_the_sum() {
        let records: Vec<_> = (1..=20).map(|i| sample("C", 1, i, i as f64)).collect();
        let mut reversed = records.clone();
        reversed.reverse();

        let one_batch = merged(vec![records.clone()]).await;
        let chunked = merged(reversed.chunks(3).map(<[Sample]>::to_vec).collect()).await;

        let expected: i64 = (1..=20).sum();
        assert_eq!(one_batch.lock().await.get("C_1").unwrap().row().calls, expected);
        assert_eq!(chunked.lock().await.get("C_1").unwrap().row().calls, expected);
    }

    #[tokio::test]
    async fn the_one_where_keyless_records_are_skipped_but_reported() {
        let table = AccumulatorTable::shared();
        let mut worker = MergeWorker::new(3, table.clone());
        let batch = vec![sample("", 1, 5, 0.0), sample("D", 1, 2, 0.0)];

        let err = worker.consume(&batch).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2"), "{err}");
        let table = table.lock().await;
        assert_eq!(table.len(), 1, "the valid record is still merged");
        assert_eq!(table.get("D_1").unwrap().row().calls, 2);
    }

    #[test]
    fn the_one_where_take_then_restore_loses_nothing() {
        let now = Instant::now();
        let mut table = AccumulatorTable::new();
        table.merge("E_1", &sample("E", 1, 4, 1.0), now);

        let taken = table.take_dirty();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].delta.calls, 4);
        assert_eq!(table.dirty_count(), 0);
        assert!(table.take_dirty().is_empty(), "clean accumulators have nothing to give");

        // 📬 more records arrive while the write is in flight, then the write fails
        table.merge("E_1", &sample("E", 1, 3, 2.0), now);
        for pending in taken {
            table.restore(pending);
        }
        let retry = table.take_dirty();
        assert_eq!(retry[0].delta.calls, 7);
        assert_eq!(retry[0].delta.total, 7);
        assert_eq!(retry[0].delta.usage, 2.0);
        assert_eq!(table.get("E_1").unwrap().row().total, 7, "running totals keep counting");
    }

    #[test]
    fn the_one_where_restore_resurrects_a_missing_key() {
        let mut table: AccumulatorTable<Sample> = AccumulatorTable::new();
        let delta = sample("F", 1, 9, 0.0);
        table.restore(PendingFlush {
            key: "F_1".to_string(),
            delta: delta.clone(),
        });
        let acc = table.get("F_1").unwrap();
        assert!(acc.is_dirty());
        assert_eq!(acc.row(), &delta);
        assert_eq!(acc.row().zeroed_baseline().calls, 0);
    }

    #[test]
    fn the_one_where_only_clean_idle_accumulators_are_evicted() {
        let start = Instant::now();
        let mut table = AccumulatorTable::new();
        table.merge("old_1", &sample("old", 1, 1, 0.0), start);
        table.merge("dirty_1", &sample("dirty", 1, 1, 0.0), start);
        let _ = table.take_dirty();
        table.merge("dirty_1", &sample("dirty", 1, 1, 0.0), start);

        let later = start + Duration::from_secs(71);
        let evicted = table.evict(later, Duration::from_secs(70), 100);
        assert_eq!(evicted, 1);
        assert!(table.get("old_1").is_none());
        assert!(table.get("dirty_1").is_some(), "🔒 dirty rows are never evicted");
    }

    #[test]
    fn the_one_where_the_cap_evicts_the_oldest_clean_rows_first() {
        let start = Instant::now();
        let mut table = AccumulatorTable::new();
        for i in 0..5u64 {
            let key = format!("k{i}_1");
            table.merge(&key, &sample(&format!("k{i}"), 1, 1, 0.0), start + Duration::from_secs(i));
        }
        let _ = table.take_dirty();

        let evicted = table.evict(start + Duration::from_secs(5), Duration::from_secs(3600), 3);
        assert_eq!(evicted, 2);
        assert!(table.get("k0_1").is_none());
        assert!(table.get("k1_1").is_none());
        assert!(table.get("k4_1").is_some());
    }
}
