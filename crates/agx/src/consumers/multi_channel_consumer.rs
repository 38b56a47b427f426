//! 🔁 MultiChannelConsumer: one loop, many groups, a pacer per group.
//!
//! 🎬 *[cycle starts. group 0 is slammed. groups 1 through 41 have not seen a record
//! since Tuesday. the loop checks group 0. it nods at the others and moves on.]*
//!
//! Each cycle walks the groups in order. A group's [`PollPacer`] says whether to look.
//! A look drains every channel of the group in one go and hands the batch to that
//! group's [`GroupConsumer`]. If no group produced anything, the loop naps for
//! `consume_cycle` or until shutdown, whichever comes first.
//!
//! On shutdown the loop stops pacing and drains every group until all of them are
//! empty, so records accepted before the stop still reach their consumer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{GroupConsumer, PollPacer, PriorityConfig};
use crate::channels::ChannelGroup;
use crate::workers::Worker;

struct GroupSlot<T> {
    group: Arc<ChannelGroup<T>>,
    consumer: Box<dyn GroupConsumer<T>>,
    pacer: PollPacer,
}

pub struct MultiChannelConsumer<T> {
    name: String,
    slots: Vec<GroupSlot<T>>,
    consume_cycle: Duration,
    priority: PriorityConfig,
    shutdown: watch::Receiver<bool>,
    // 🧽 reused between polls so a busy loop is not allocating every cycle
    scratch: Vec<T>,
}

impl<T: Send + Sync + 'static> MultiChannelConsumer<T> {
    pub fn new(
        name: impl Into<String>,
        consume_cycle: Duration,
        priority: PriorityConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            consume_cycle,
            priority,
            shutdown,
            scratch: Vec::new(),
        }
    }

    /// ➕ Attach a group and the consumer that eats its batches. Order of attachment is
    /// the order of polling inside a cycle.
    pub fn add_group(&mut self, group: Arc<ChannelGroup<T>>, consumer: Box<dyn GroupConsumer<T>>) {
        debug!("🔗 {} now services group '{}'", self.name, group.name());
        self.slots.push(GroupSlot {
            group,
            consumer,
            pacer: PollPacer::new(self.priority),
        });
    }

    pub fn group_count(&self) -> usize {
        self.slots.len()
    }

    /// 🔄 One paced pass over every group. Returns `true` if any group handed over data.
    pub async fn run_cycle(&mut self) -> bool {
        let mut had_data = false;
        for slot in &mut self.slots {
            if !slot.pacer.should_poll() {
                continue;
            }
            if Self::poll_slot(slot, &mut self.scratch).await {
                had_data = true;
            }
        }
        had_data
    }

    /// 🧹 Drain every group, ignoring the pacers, until a full pass finds nothing.
    pub async fn final_drain(&mut self) {
        loop {
            let mut had_data = false;
            for slot in &mut self.slots {
                if Self::poll_slot(slot, &mut self.scratch).await {
                    had_data = true;
                }
            }
            if !had_data {
                break;
            }
        }
    }

    async fn poll_slot(slot: &mut GroupSlot<T>, scratch: &mut Vec<T>) -> bool {
        scratch.clear();
        let drained = slot.group.drain_all(scratch);
        if drained == 0 {
            slot.pacer.on_empty();
            slot.consumer.nothing_to_consume().await;
            return false;
        }

        slot.pacer.on_batch(drained, slot.group.total_capacity());
        trace!(
            "🍽️ group '{}' handed over {} records (priority now {})",
            slot.group.name(),
            drained,
            slot.pacer.priority()
        );
        // 💥 a failing consumer only hurts its own group
        if let Err(err) = slot.consumer.consume(scratch).await {
            slot.consumer.on_error(scratch, err).await;
        }
        slot.consumer.on_exit().await;
        scratch.clear();
        true
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl<T: Send + Sync + 'static> Worker for MultiChannelConsumer<T> {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!("🚀 {} started with {} groups", self.name, self.slots.len());
            while !self.stop_requested() {
                if self.run_cycle().await {
                    // 🤝 a group that never runs dry still lets the rest of the runtime in
                    tokio::task::yield_now().await;
                    continue;
                }
                let nap = self.consume_cycle;
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    changed = self.shutdown.changed() => {
                        // sender gone counts as a stop
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("🧹 {} stopping, final drain", self.name);
            self.final_drain().await;
            info!("🏁 {} stopped", self.name);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::BufferPolicy;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tally {
        seen: Mutex<Vec<u32>>,
        failed_batches: AtomicUsize,
        exits: AtomicUsize,
        empties: AtomicUsize,
    }

    struct Recorder {
        tally: Arc<Tally>,
        explode: bool,
    }

    #[async_trait]
    impl GroupConsumer<u32> for Recorder {
        async fn consume(&mut self, batch: &[u32]) -> Result<()> {
            if self.explode {
                anyhow::bail!("💥 consumer has had enough");
            }
            self.tally.seen.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }

        async fn on_error(&mut self, batch: &[u32], _err: anyhow::Error) {
            assert!(!batch.is_empty());
            self.tally.failed_batches.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_exit(&mut self) {
            self.tally.exits.fetch_add(1, Ordering::SeqCst);
        }

        async fn nothing_to_consume(&mut self) {
            self.tally.empties.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn group(name: &str) -> Arc<ChannelGroup<u32>> {
        Arc::new(ChannelGroup::new(name, 2, 16, BufferPolicy::Drop, Duration::from_millis(5)))
    }

    fn consumer(shutdown: watch::Receiver<bool>) -> MultiChannelConsumer<u32> {
        MultiChannelConsumer::new(
            "test-consumer",
            Duration::from_millis(1),
            PriorityConfig::default(),
            shutdown,
        )
    }

    #[tokio::test]
    async fn the_one_where_one_cranky_consumer_does_not_spoil_the_other_group() {
        let (_tx, rx) = watch::channel(false);
        let mut loop_ = consumer(rx);
        let (good_group, bad_group) = (group("good"), group("bad"));
        let (good, bad) = (Arc::new(Tally::default()), Arc::new(Tally::default()));
        loop_.add_group(good_group.clone(), Box::new(Recorder { tally: good.clone(), explode: false }));
        loop_.add_group(bad_group.clone(), Box::new(Recorder { tally: bad.clone(), explode: true }));

        for i in 0..6 {
            assert!(good_group.offer(i).await);
            assert!(bad_group.offer(i).await);
        }
        for _ in 0..10 {
            loop_.run_cycle().await;
        }

        let mut seen = good.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(bad.failed_batches.load(Ordering::SeqCst), 1);
        assert_eq!(bad.exits.load(Ordering::SeqCst), 1, "on_exit runs after failures too");
        assert!(bad_group.is_empty(), "the failed batch is not re-queued");
    }

    #[tokio::test]
    async fn the_one_where_an_idle_group_is_barely_bothered() {
        let (_tx, rx) = watch::channel(false);
        let mut loop_ = consumer(rx);
        let tally = Arc::new(Tally::default());
        loop_.add_group(group("quiet"), Box::new(Recorder { tally: tally.clone(), explode: false }));

        for _ in 0..20 {
            assert!(!loop_.run_cycle().await);
        }
        let empties = tally.empties.load(Ordering::SeqCst);
        assert!((1..=4).contains(&empties), "polled {empties} times in 20 idle cycles");
        assert_eq!(tally.exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn the_one_where_shutdown_still_delivers_everything_already_queued() {
        let (tx, rx) = watch::channel(false);
        let mut loop_ = consumer(rx);
        let g = group("late");
        let tally = Arc::new(Tally::default());
        loop_.add_group(g.clone(), Box::new(Recorder { tally: tally.clone(), explode: false }));
        assert_eq!(loop_.group_count(), 1);

        for i in 0..20 {
            assert!(g.offer(i).await);
        }
        tx.send(true).unwrap();
        loop_.start().await.unwrap().unwrap();

        assert_eq!(tally.seen.lock().unwrap().len(), 20);
        assert!(g.is_empty());
    }

    /// 🔁 Puts every batch straight back into its own group, so the group never goes quiet.
    struct Boomerang {
        group: Arc<ChannelGroup<u32>>,
        batches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GroupConsumer<u32> for Boomerang {
        async fn consume(&mut self, batch: &[u32]) -> Result<()> {
            for item in batch {
                self.group.offer(*item).await;
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn the_one_where_a_group_that_never_runs_dry_still_shares_the_thread() {
        let (tx, rx) = watch::channel(false);
        let mut loop_ = consumer(rx);
        // every batch fills the group, so the pacer keeps it above the threshold
        let g = Arc::new(ChannelGroup::new("hot", 1, 4, BufferPolicy::Drop, Duration::from_millis(5)));
        let batches = Arc::new(AtomicUsize::new(0));
        loop_.add_group(g.clone(), Box::new(Boomerang { group: g.clone(), batches: batches.clone() }));
        for i in 0..4 {
            assert!(g.offer(i).await);
        }

        let handle = loop_.start();
        // 🧵 only one thread: getting past this loop means the busy consumer let us run
        while batches.load(Ordering::SeqCst) < 50 {
            tokio::task::yield_now().await;
        }
        g.close();
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(batches.load(Ordering::SeqCst) >= 50);
    }

    #[tokio::test]
    async fn the_one_where_the_loop_naps_then_wakes_for_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut loop_ = MultiChannelConsumer::new(
            "sleepy",
            Duration::from_secs(3600),
            PriorityConfig::default(),
            rx,
        );
        let tally = Arc::new(Tally::default());
        loop_.add_group(group("nap"), Box::new(Recorder { tally, explode: false }));

        let handle = loop_.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok(), "an hour-long nap must not outlast a shutdown signal");
    }
}
