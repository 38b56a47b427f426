//! 🍽️ Consumers: the loops that drain channel groups and hand batches to whoever is hungry.
//!
//! 🎬 *[thousands of shards. most of them silent. a naive round robin polls every one,
//! every cycle, forever. the CPU fan weeps.]*
//!
//! The [`MultiChannelConsumer`] owns a fixed set of groups and asks a [`PollPacer`]
//! per group whether this cycle is worth a look. Busy groups get polled every cycle,
//! quiet ones back off to roughly one look in eleven cycles. When nothing anywhere had
//! data, the loop naps for `consume_cycle`.
//!
//! Whatever eats the batches implements [`GroupConsumer`]. Its errors stay in its own
//! group: `on_error` gets the batch, the loop keeps going, nobody else notices. 🦆

use anyhow::Error;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

mod multi_channel_consumer;
mod poll_pacer;

pub use multi_channel_consumer::MultiChannelConsumer;
pub use poll_pacer::PollPacer;

/// 🍴 The callback side of a channel group.
///
/// # Contract 📜
/// - `consume` gets every non-empty batch drained from the group.
/// - `on_error` replaces propagation when `consume` fails. Default: a `warn!` line.
/// - `on_exit` runs after every non-empty batch, success or failure.
/// - `nothing_to_consume` runs when a poll came back empty.
#[async_trait]
pub trait GroupConsumer<T: Send + Sync>: Send {
    async fn consume(&mut self, batch: &[T]) -> anyhow::Result<()>;

    async fn on_error(&mut self, batch: &[T], err: Error) {
        warn!("💀 failed to consume a batch of {} records: {:#}", batch.len(), err);
    }

    async fn on_exit(&mut self) {}

    async fn nothing_to_consume(&mut self) {}
}

/// 🎚️ Knobs for the poll back-off. Defaults, not commandments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Groups below this priority are skipped for the cycle.
    pub poll_threshold: i32,
    /// Priority gained per skipped cycle.
    pub ramp_step: i32,
    /// Empty polls tolerated (halving each time) before pinning to `idle_floor`.
    pub backoff_after_empty: u32,
    /// Where a long-idle group's priority lands.
    pub idle_floor: i32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            poll_threshold: 50,
            ramp_step: 10,
            backoff_after_empty: 5,
            idle_floor: -50,
        }
    }
}
