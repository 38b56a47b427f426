//! 🔌 Backends: where aggregated rows go to live, and how records hop between nodes.
//!
//! 🎬 *[the persistence timer knocks. storage opens the door a crack. "got a row for
//! `A_100`?" "maybe." "I'll take that as a yes."]*
//!
//! The core only talks to storage through [`Storage`]. Real engines (document stores,
//! relational, whatever ops picked this quarter) live outside this crate and implement
//! the trait. What lives here is the in-memory pair used by tests and the CLI host:
//! [`InMemoryStorage`] and [`InMemoryTransport`].
//!
//! 🦆 The duck has read every row. The duck has opinions. The duck is not a backend.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::merge::Metric;

mod in_mem;

pub use in_mem::{InMemoryStorage, InMemoryTransport};

/// 🗄️ A row store keyed by aggregation key.
///
/// # Contract 📜
/// - `get` returns the persisted row for `key`, or `None` if storage has never seen it.
/// - `insert` writes a brand new row, keyed by `row.aggregation_key()`.
/// - `update` overwrites the row stored under `key`.
/// - Each call stands alone. The persistence timer handles failures per key, so a
///   backend should fail one call rather than poisoning the next.
#[async_trait]
pub trait Storage<M: Metric>: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<M>>;

    async fn insert(&self, row: &M) -> Result<()>;

    async fn update(&self, key: &str, row: &M) -> Result<()>;
}
