//! 🚰 Channels: where records wait politely (or get bounced at the door).
//!
//! 🎬 *[a bounded queue, 10,000 seats, all taken. record #10,001 approaches the rope.]*
//! *["Block or drop?" asks the bouncer. The config decides. The record has no say.]*
//!
//! - [`BoundedChannel`]: one fixed-capacity FIFO. Many producers, one drainer.
//! - [`ChannelGroup`]: N channels wearing a trench coat, pretending to be one queue.
//!
//! Backpressure policy is a [`BufferPolicy`]. Rejections never bubble up as errors;
//! they bump a drop counter in [`ChannelStats`] and the producer moves on with its life. 🦆

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

mod bounded_channel;
mod channel_group;

pub use bounded_channel::BoundedChannel;
pub use channel_group::ChannelGroup;

/// 🚪 What a producer does when the channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// ⏳ Wait up to the block timeout for a free slot, then give up and count a drop.
    #[default]
    Block,
    /// 🗑️ Reject right away and count a drop.
    Drop,
}

/// 📊 Per-channel counters. Relaxed atomics, because nobody balances a budget with these.
#[derive(Debug, Default)]
pub struct ChannelStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
