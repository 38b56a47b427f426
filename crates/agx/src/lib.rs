//! 📊 agx: the ingestion and aggregation core of an APM backend.
//!
//! 🎬 *[agents everywhere, all talking at once. spans, JVM gauges, component calls.
//! somebody has to add them up before the database drowns.]*
//!
//! Records come in through a [`WorkerRef`](worker_refs::WorkerRef), get routed by
//! aggregation key to a shard, wait in bounded channels, get merged by the consumer that
//! owns the shard, and reach storage when the persistence timer comes around.
//!
//! ```text
//! dispatch ─▶ Router ─▶ ChannelGroup ─▶ MultiChannelConsumer ─▶ MergeWorker ─▶ table
//!                                                                              │
//!                                        Storage ◀── PersistenceTimer ◀────────┘
//! ```

pub mod aggregation;
pub mod app_config;
pub mod backends;
pub mod channels;
pub mod consumers;
pub mod host;
pub mod merge;
pub mod metrics;
pub mod persistence;
pub mod routing;
pub mod supervisors;
pub mod worker_refs;
pub mod workers;

pub use host::{KindSummary, RunSummary, run};
