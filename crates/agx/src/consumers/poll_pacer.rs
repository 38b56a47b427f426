//! ⏱️ PollPacer: decides, per group and per cycle, whether polling is worth the trouble.
//!
//! Priority starts at 0 and lives roughly in `[idle_floor, 100]`.
//! - below `poll_threshold`: skip the cycle and climb by `ramp_step`.
//! - a batch arrived: average the old priority with the batch's load score.
//! - empty poll: halve, or after `backoff_after_empty` empties in a row, drop to the floor.
//!
//! With the defaults a long-idle group is looked at once every 11 cycles, and a group
//! that fills its channels stays at the top and is polled every cycle.

use super::PriorityConfig;

#[derive(Debug, Clone)]
pub struct PollPacer {
    priority: i32,
    consecutive_empty: u32,
    config: PriorityConfig,
}

impl PollPacer {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            priority: 0,
            consecutive_empty: 0,
            config,
        }
    }

    /// 🎲 Ask before polling. A `false` answer already counts as a skipped cycle.
    pub fn should_poll(&mut self) -> bool {
        if self.priority < self.config.poll_threshold {
            self.priority = self.priority.saturating_add(self.config.ramp_step);
            return false;
        }
        true
    }

    /// 📦 A poll returned `batch_size` records out of a group holding `group_capacity`.
    pub fn on_batch(&mut self, batch_size: usize, group_capacity: usize) {
        let load = (batch_size.saturating_mul(100) / group_capacity.max(1)).min(100) as i32;
        self.priority = (self.priority + load) / 2;
        self.consecutive_empty = 0;
    }

    /// 🕳️ A poll came back empty.
    pub fn on_empty(&mut self) {
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        if self.consecutive_empty < self.config.backoff_after_empty {
            self.priority /= 2;
        } else {
            self.priority = self.config.idle_floor;
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}
