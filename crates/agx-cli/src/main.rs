//! 🚀 agx-cli: the front door, the bouncer, the maitre d' of agx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, sets up logging, replays a record file through the aggregation core,
//! and prints what storage ended up holding. Like a manager, but with a table. 🦆

use std::path::PathBuf;

use agx::app_config::{SourceConfig, load_config};
use agx::{RunSummary, run};
use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📊 Replay NDJSON telemetry records through the agx aggregation core.
#[derive(Parser)]
#[command(name = "agx", about)]
struct Cli {
    /// Path to the TOML configuration file. Without it, only AGX_* env vars apply.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or a full directive). Defaults to RUST_LOG, then info.
    #[arg(long)]
    log_level: Option<String>,

    /// Print every persisted row, not just the per-kind counters.
    #[arg(long)]
    show_rows: bool,

    /// NDJSON record file. Overrides `[source] file_name`.
    records: Option<PathBuf>,
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Parse args, init tracing
/// 2. Load config (the moment of truth)
/// 3. Run the replay (send it and pray 🙏)
/// 4. Print the summary, or peel the error onion and exit 1
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 📡 explicit flag wins, then RUST_LOG, then plain old info
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("💀 invalid log level: {level}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut app_config = load_config(cli.config.as_deref())
        .context("💀 In agx-cli, main, we couldn't load the config. Check the file and the AGX_* env vars.")?;
    if let Some(records) = cli.records {
        app_config.source = Some(SourceConfig { file_name: records });
    }

    match run(app_config).await {
        Ok(summary) => {
            print_summary(&summary, cli.show_rows);
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // 🧅 peel the onion of sadness, one layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            std::process::exit(1);
        }
    }
}

fn print_summary(summary: &RunSummary, show_rows: bool) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "kind", "enqueued", "dropped", "inserted", "updated", "skipped", "failed", "rows",
    ]);
    for kind in &summary.kinds {
        let numbers = [
            kind.enqueued,
            kind.dropped,
            kind.flush.inserted as u64,
            kind.flush.updated as u64,
            kind.flush.skipped as u64,
            kind.flush.failed as u64,
            kind.rows.len() as u64,
        ];
        let mut row = vec![Cell::new(kind.kind)];
        row.extend(
            numbers
                .iter()
                .map(|n| Cell::new(n).set_alignment(CellAlignment::Right)),
        );
        table.add_row(row);
    }
    println!("{table}");
    println!(
        "📄 {} lines read, {} undecodable",
        summary.lines_read, summary.undecodable
    );

    if show_rows {
        let mut rows = Table::new();
        rows.set_content_arrangement(ContentArrangement::Dynamic);
        rows.set_header(vec!["kind", "row"]);
        for kind in &summary.kinds {
            for row in &kind.rows {
                rows.add_row(vec![Cell::new(kind.kind), Cell::new(row)]);
            }
        }
        println!("{rows}");
    }
}
