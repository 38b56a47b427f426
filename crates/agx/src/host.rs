//! 🏠 Host: replays an NDJSON file through one role per built-in metric kind.
//!
//! This is what the CLI runs. Every line is `{"kind": "...", ...fields}`. Lines that do
//! not decode are counted and logged, and the replay keeps going. Rows land in
//! [`InMemoryStorage`], so the summary can show exactly what storage ended up with.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, trace, warn};

use crate::app_config::AppConfig;
use crate::backends::InMemoryStorage;
use crate::merge::Metric;
use crate::metrics::{ComponentCalls, InboundRecord, JvmMemory, ServiceCalls, ServiceTraffic};
use crate::persistence::FlushReport;
use crate::supervisors::{Role, Supervisor};
use crate::worker_refs::{Dispatch, WorkerRef};

/// 📋 What one replay did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub lines_read: u64,
    pub undecodable: u64,
    pub kinds: Vec<KindSummary>,
}

/// 📋 Per metric kind: dispatch counters, flush totals, and the rows storage holds.
#[derive(Debug, Clone)]
pub struct KindSummary {
    pub kind: &'static str,
    pub enqueued: u64,
    pub dropped: u64,
    pub flush: FlushReport,
    pub rows: Vec<Value>,
}

struct Lane<M> {
    role: Role<M>,
    worker_ref: WorkerRef<M>,
    storage: InMemoryStorage<M>,
    enqueued: u64,
    dropped: u64,
}

impl<M: Metric> Lane<M> {
    fn start(supervisor: &Supervisor) -> Result<Self> {
        let storage = InMemoryStorage::new();
        let role = supervisor
            .start_role(Arc::new(storage.clone()))
            .with_context(|| format!("💀 failed to start the {} role", M::NAME))?;
        Ok(Self {
            worker_ref: role.worker_ref(),
            role,
            storage,
            enqueued: 0,
            dropped: 0,
        })
    }

    async fn dispatch(&mut self, record: M) -> Result<()> {
        match self.worker_ref.dispatch(record).await? {
            Dispatch::Dropped => self.dropped += 1,
            Dispatch::Enqueued | Dispatch::Forwarded => self.enqueued += 1,
        }
        Ok(())
    }

    async fn finish(self) -> Result<KindSummary> {
        let flush = self.role.shutdown().await?;
        let rows = self
            .storage
            .snapshot()
            .await
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("💀 failed to render {} rows", M::NAME))?;
        Ok(KindSummary {
            kind: M::NAME,
            enqueued: self.enqueued,
            dropped: self.dropped,
            flush,
            rows,
        })
    }
}

struct Lanes {
    service_calls: Lane<ServiceCalls>,
    jvm_memory: Lane<JvmMemory>,
    component_calls: Lane<ComponentCalls>,
    service_traffic: Lane<ServiceTraffic>,
}

impl Lanes {
    async fn dispatch(&mut self, record: InboundRecord) -> Result<()> {
        match record {
            InboundRecord::ServiceCalls(r) => self.service_calls.dispatch(r).await,
            InboundRecord::JvmMemory(r) => self.jvm_memory.dispatch(r).await,
            InboundRecord::ComponentCalls(r) => self.component_calls.dispatch(r).await,
            InboundRecord::ServiceTraffic(r) => self.service_traffic.dispatch(r).await,
        }
    }

    async fn replay(&mut self, path: &Path, summary: &mut RunSummary) -> Result<()> {
        let file = File::open(path)
            .await
            .with_context(|| format!("💀 could not open record file '{}'", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut line_number = 0u64;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("💀 failed reading '{}' after line {}", path.display(), line_number))?
        {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            summary.lines_read += 1;
            match InboundRecord::parse(&line) {
                Ok(record) => {
                    trace!("📨 line {} is a {} record", line_number, record.kind());
                    self.dispatch(record).await?
                }
                Err(err) => {
                    summary.undecodable += 1;
                    warn!("🗑️ skipping line {}: {:#}", line_number, err);
                }
            }
        }
        Ok(())
    }
}

/// 🚀 Replay `source.file_name`, shut every role down (final drain, final flush), and
/// report what storage holds.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    let source = app_config
        .source
        .clone()
        .context("💀 no [source] configured, so there is nothing to replay")?;
    let supervisor = Supervisor::new(app_config)?;

    let mut lanes = Lanes {
        service_calls: Lane::start(&supervisor)?,
        jvm_memory: Lane::start(&supervisor)?,
        component_calls: Lane::start(&supervisor)?,
        service_traffic: Lane::start(&supervisor)?,
    };

    let mut summary = RunSummary::default();
    // 🛑 roles shut down even if the replay failed halfway, so nothing is left running
    let replayed = lanes.replay(&source.file_name, &mut summary).await;

    let Lanes {
        service_calls,
        jvm_memory,
        component_calls,
        service_traffic,
    } = lanes;
    summary.kinds = vec![
        service_calls.finish().await?,
        jvm_memory.finish().await?,
        component_calls.finish().await?,
        service_traffic.finish().await?,
    ];
    replayed?;

    info!(
        "✅ replayed {} lines ({} undecodable) from '{}'",
        summary.lines_read,
        summary.undecodable,
        source.file_name.display()
    );
    Ok(summary)
}
