//! 🧺 ChannelGroup: a named bundle of [`BoundedChannel`]s that one consumer services.
//!
//! Producers land on channels through a rolling partitioner (round robin on an atomic
//! counter), which keeps contention spread across the channels without caring who the
//! producer is. Key affinity is decided one level up by the router, which picks the
//! group, so spraying within a group is harmless.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BoundedChannel, BufferPolicy};

#[derive(Debug)]
pub struct ChannelGroup<T> {
    name: String,
    channels: Vec<BoundedChannel<T>>,
    rolling: AtomicUsize,
}

impl<T: Send> ChannelGroup<T> {
    /// 🏗️ `channel_count` of zero is bumped to one. An empty group is just a sad struct.
    pub fn new(
        name: impl Into<String>,
        channel_count: usize,
        channel_capacity: usize,
        policy: BufferPolicy,
        block_timeout: Duration,
    ) -> Self {
        let channels = (0..channel_count.max(1))
            .map(|_| BoundedChannel::new(channel_capacity, policy, block_timeout))
            .collect();
        Self {
            name: name.into(),
            channels,
            rolling: AtomicUsize::new(0),
        }
    }

    /// 🚪 Offer to the next channel in the rotation.
    pub async fn offer(&self, item: T) -> bool {
        let index = self.rolling.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        self.channels[index].offer(item).await
    }

    /// 🪣 Drain every channel (each up to its capacity) into `out`.
    pub fn drain_all(&self, out: &mut Vec<T>) -> usize {
        self.channels
            .iter()
            .map(|channel| channel.drain_to(out, channel.capacity()))
            .sum()
    }

    pub fn close(&self) {
        self.channels.iter().for_each(BoundedChannel::close);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 📏 Sum of every channel's capacity, the denominator of the load score.
    pub fn total_capacity(&self) -> usize {
        self.channels.iter().map(BoundedChannel::capacity).sum()
    }

    pub fn pending(&self) -> usize {
        self.channels.iter().map(BoundedChannel::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(BoundedChannel::is_empty)
    }

    pub fn accepted(&self) -> u64 {
        self.channels.iter().map(|c| c.stats().accepted()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.channels.iter().map(|c| c.stats().dropped()).sum()
    }
}
