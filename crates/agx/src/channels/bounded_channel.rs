//! 📥 BoundedChannel: a fixed-size waiting room built on `async_channel::bounded`.
//!
//! FIFO inside one channel. No promises across channels. Capacity is set once and the
//! underlying channel enforces it, so "never exceeds capacity" is the channel's job and
//! it is very good at its job.

use std::time::Duration;

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tokio::time::timeout;
use tracing::trace;

use super::{BufferPolicy, ChannelStats};

/// 📦 One partition of inbound records.
#[derive(Debug)]
pub struct BoundedChannel<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    policy: BufferPolicy,
    block_timeout: Duration,
    stats: ChannelStats,
}

impl<T: Send> BoundedChannel<T> {
    /// 🏗️ A zero capacity is quietly bumped to 1. Rendezvous channels are a different movie.
    pub fn new(capacity: usize, policy: BufferPolicy, block_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            policy,
            block_timeout,
            stats: ChannelStats::default(),
        }
    }

    /// 🚪 Try to enqueue. `true` means the record is in; `false` means it was dropped.
    ///
    /// Under [`BufferPolicy::Block`] this waits at most `block_timeout` for room, and it
    /// never returns `false` before that timeout has elapsed unless the channel is closed.
    pub async fn offer(&self, item: T) -> bool {
        let item = match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.record_accepted();
                return true;
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.record_dropped();
                return false;
            }
            Err(TrySendError::Full(item)) => item,
        };

        match self.policy {
            BufferPolicy::Drop => {
                trace!("🗑️ channel full ({} slots), dropping record", self.capacity);
                self.stats.record_dropped();
                false
            }
            BufferPolicy::Block => match timeout(self.block_timeout, self.tx.send(item)).await {
                Ok(Ok(())) => {
                    self.stats.record_accepted();
                    true
                }
                Ok(Err(_closed)) => {
                    self.stats.record_dropped();
                    false
                }
                Err(_elapsed) => {
                    trace!(
                        "⏳ channel stayed full for {:?}, dropping record",
                        self.block_timeout
                    );
                    self.stats.record_dropped();
                    false
                }
            },
        }
    }

    /// 🪣 Move up to `max_items` pending records into `out`. Returns how many moved.
    pub fn drain_to(&self, out: &mut Vec<T>, max_items: usize) -> usize {
        let mut moved = 0;
        while moved < max_items {
            match self.rx.try_recv() {
                Ok(item) => {
                    out.push(item);
                    moved += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        moved
    }

    /// 🔒 Stop accepting new records. Whatever is already queued can still be drained.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}
