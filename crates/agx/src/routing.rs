//! 🧭 Routing: aggregation key in, shard index out.
//!
//! `DefaultHasher::new()` uses fixed keys, so the same key lands on the same shard for
//! every producer task in the process. Across Rust releases the hash may change, which is
//! fine: shard assignment only has to hold for one process topology.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{Result, bail};

/// 🎯 Maps aggregation keys onto `0..shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Router {
    shard_count: usize,
}

impl Router {
    pub fn new(shard_count: usize) -> Result<Self> {
        if shard_count == 0 {
            bail!("💀 a router with zero shards has nowhere to send anything");
        }
        Ok(Self { shard_count })
    }

    /// 🔑 Pure function of `key` and `shard_count`.
    pub fn route(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }
}
