//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. Env vars prefixed `AGX_` form the base layer (nested keys split
//! on `__`, so `AGX_RUNTIME__SHARD_COUNT=8`), and an optional TOML file goes on top.
//! Every section is optional and every knob has a default.
//!
//! The metric schemas are not configuration. They are declared in code with
//! [`metric_row!`](crate::metric_row), and the compiler checks them for free.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::channels::BufferPolicy;
use crate::consumers::PriorityConfig;
use crate::worker_refs::NodeAddress;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// 📄 Only the CLI host needs this; library users bring their own records.
    #[serde(default)]
    pub source: Option<SourceConfig>,
}

/// 🏃 Channel and consumer knobs, applied to every role.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Channel groups per role. Also the router's modulus.
    pub shard_count: usize,
    #[serde(alias = "channel_count")]
    pub channels_per_group: usize,
    #[serde(alias = "buffer_size")]
    pub channel_capacity: usize,
    pub buffer_policy: BufferPolicy,
    pub block_timeout_ms: u64,
    /// Nap length when a whole cycle found nothing.
    pub consume_cycle_ms: u64,
    /// Consumer tasks per role. Groups are dealt out round robin.
    pub consumer_loops: usize,
    pub priority: PriorityConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            channels_per_group: 2,
            channel_capacity: 10_000,
            buffer_policy: BufferPolicy::Block,
            block_timeout_ms: 100,
            consume_cycle_ms: 20,
            consumer_loops: 2,
            priority: PriorityConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn consume_cycle(&self) -> Duration {
        Duration::from_millis(self.consume_cycle_ms)
    }

    /// 🚨 Reject shapes that cannot work at all. Small-but-odd values are allowed.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            bail!("💀 runtime.shard_count must be at least 1");
        }
        if self.consumer_loops == 0 {
            bail!("💀 runtime.consumer_loops must be at least 1, or nobody drains anything");
        }
        Ok(())
    }
}

/// 💾 Persistence timer knobs.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub flush_period_secs: u64,
    /// Clean accumulators idle longer than this are evicted.
    pub accumulator_ttl_secs: u64,
    /// Per (role, shard) table.
    pub max_accumulators: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_period_secs: 25,
            accumulator_ttl_secs: 70,
            max_accumulators: 1_000_000,
        }
    }
}

impl PersistenceConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn accumulator_ttl(&self) -> Duration {
        Duration::from_secs(self.accumulator_ttl_secs)
    }
}

/// 🌐 Cluster peers, in shard order: shard `i` lives on `nodes[i]`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
}

/// 📄 Where the CLI host reads NDJSON records from.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub file_name: PathBuf,
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of defaults.
///
/// - `config_file_name` is `None` → env vars only.
/// - `config_file_name` is `Some` → env vars + TOML file, merged. TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("AGX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (AGX_*).",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (AGX_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .runtime
        .validate()
        .context("💀 Configuration parsed but does not describe a runnable pipeline")?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_test_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("💀 no temp file for us today");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config. The filesystem said 'new phone who dis'.");
        file
    }

    #[test]
    fn the_one_where_every_knob_is_turned() {
        let file = write_test_config(
            r#"
            [runtime]
            shard_count = 8
            channels_per_group = 3
            channel_capacity = 500
            buffer_policy = "drop"
            block_timeout_ms = 7
            consume_cycle_ms = 5
            consumer_loops = 4

            [runtime.priority]
            poll_threshold = 40
            idle_floor = -80

            [persistence]
            flush_period_secs = 10
            accumulator_ttl_secs = 30
            max_accumulators = 99

            [cluster]
            nodes = [{ host = "10.0.0.1", port = 11800 }, { host = "10.0.0.2", port = 11801 }]

            [source]
            file_name = "records.ndjson"
            "#,
        );

        let app_config = load_config(Some(file.path())).expect("💀 a fully specified config should parse");
        let runtime = &app_config.runtime;
        assert_eq!(runtime.shard_count, 8);
        assert_eq!(runtime.channels_per_group, 3);
        assert_eq!(runtime.channel_capacity, 500);
        assert_eq!(runtime.buffer_policy, BufferPolicy::Drop);
        assert_eq!(runtime.block_timeout(), Duration::from_millis(7));
        assert_eq!(runtime.consume_cycle(), Duration::from_millis(5));
        assert_eq!(runtime.consumer_loops, 4);
        assert_eq!(runtime.priority.poll_threshold, 40);
        assert_eq!(runtime.priority.ramp_step, 10, "unset priority knobs keep their defaults");
        assert_eq!(runtime.priority.idle_floor, -80);

        assert_eq!(app_config.persistence.flush_period(), Duration::from_secs(10));
        assert_eq!(app_config.persistence.accumulator_ttl(), Duration::from_secs(30));
        assert_eq!(app_config.persistence.max_accumulators, 99);
        assert_eq!(app_config.cluster.nodes[1], NodeAddress::new("10.0.0.2", 11801));
        assert_eq!(
            app_config.source.map(|s| s.file_name),
            Some(PathBuf::from("records.ndjson"))
        );
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let file = write_test_config("");
        let app_config: AppConfig = Figment::new()
            .merge(Toml::file(file.path()))
            .extract()
            .expect("💀 an empty file is a valid config");

        assert_eq!(app_config.runtime, RuntimeConfig::default());
        assert_eq!(app_config.runtime.channel_capacity, 10_000);
        assert_eq!(app_config.runtime.buffer_policy, BufferPolicy::Block);
        assert_eq!(app_config.persistence.flush_period(), Duration::from_secs(25));
        assert_eq!(app_config.persistence.accumulator_ttl(), Duration::from_secs(70));
        assert!(app_config.cluster.nodes.is_empty());
        assert!(app_config.source.is_none());
    }

    #[test]
    fn the_one_where_old_knob_names_still_answer() {
        let file = write_test_config(
            r#"
            [runtime]
            channel_count = 6
            buffer_size = 64
            "#,
        );
        let app_config: AppConfig = Figment::new()
            .merge(Toml::file(file.path()))
            .extract()
            .expect("💀 aliases should parse");
        assert_eq!(app_config.runtime.channels_per_group, 6);
        assert_eq!(app_config.runtime.channel_capacity, 64);
    }

    #[test]
    fn the_one_where_zero_shards_is_a_config_error() {
        let file = write_test_config("[runtime]\nshard_count = 0\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("shard_count"));
    }
}
