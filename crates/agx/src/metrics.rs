//! 📊 The built-in metric kinds, plus the tagged envelope the host decodes them from.
//!
//! Each kind is a [`metric_row!`](crate::metric_row) struct, so its merge behavior is
//! declared next to the field it applies to. Keys follow `<entity>_<time-bucket>`.
//! An empty entity id yields an empty key, which the merge worker refuses.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::merge::Metric;
use crate::metric_row;

fn bucket_key(entity: &str, time_bucket: i64) -> String {
    if entity.is_empty() {
        return String::new();
    }
    format!("{}_{}", entity, time_bucket)
}

metric_row! {
    /// 📞 Call counts and latency per service per minute bucket.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ServiceCalls {
        #[merge(identity)]
        pub service_id: String,
        #[merge(identity)]
        pub time_bucket: i64,
        #[merge(accumulate)]
        #[serde(default)]
        pub calls: i64,
        #[merge(accumulate)]
        #[serde(default)]
        pub duration_sum_ms: i64,
        #[merge(accumulate)]
        #[serde(default)]
        pub errors: i64,
    }
}

impl Metric for ServiceCalls {
    const NAME: &'static str = "service_calls";

    fn aggregation_key(&self) -> String {
        bucket_key(&self.service_id, self.time_bucket)
    }
}

metric_row! {
    /// ☕ JVM heap gauges plus a GC counter that only ever grows.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct JvmMemory {
        #[merge(identity)]
        pub instance_id: String,
        #[merge(identity)]
        pub time_bucket: i64,
        #[merge(replace)]
        pub heap_used: f64,
        #[merge(replace)]
        pub heap_max: f64,
        #[merge(accumulate, running_total)]
        #[serde(default)]
        pub gc_count: i64,
    }
}

impl Metric for JvmMemory {
    const NAME: &'static str = "jvm_memory";

    fn aggregation_key(&self) -> String {
        bucket_key(&self.instance_id, self.time_bucket)
    }
}

metric_row! {
    /// 🧩 Calls made through one instrumented component (an HTTP client, a JDBC driver...).
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ComponentCalls {
        #[merge(identity)]
        pub entity_id: String,
        #[merge(identity)]
        pub time_bucket: i64,
        #[merge(identity)]
        pub component_id: i32,
        #[merge(accumulate)]
        #[serde(default)]
        pub calls: i64,
        #[merge(replace)]
        #[serde(default)]
        pub last_peer: String,
        #[merge(replace)]
        #[serde(default)]
        pub last_sample: Vec<u8>,
    }
}

impl Metric for ComponentCalls {
    const NAME: &'static str = "component_calls";

    fn aggregation_key(&self) -> String {
        if self.entity_id.is_empty() {
            return String::new();
        }
        format!("{}-{}_{}", self.entity_id, self.component_id, self.time_bucket)
    }
}

metric_row! {
    /// 🚦 "This service exists." Written once, never updated.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ServiceTraffic {
        #[merge(identity)]
        pub service_id: String,
        #[merge(identity)]
        pub time_bucket: i64,
        #[merge(replace)]
        pub name: String,
        #[merge(replace)]
        #[serde(default)]
        pub layer: String,
    }
}

impl Metric for ServiceTraffic {
    const NAME: &'static str = "service_traffic";
    const SUPPORTS_UPDATE: bool = false;

    fn aggregation_key(&self) -> String {
        bucket_key(&self.service_id, self.time_bucket)
    }
}

/// 📨 One NDJSON line as the host reads it: `{"kind": "service_calls", ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundRecord {
    ServiceCalls(ServiceCalls),
    JvmMemory(JvmMemory),
    ComponentCalls(ComponentCalls),
    ServiceTraffic(ServiceTraffic),
}

impl InboundRecord {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("failed to decode inbound record")
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundRecord::ServiceCalls(_) => ServiceCalls::NAME,
            InboundRecord::JvmMemory(_) => JvmMemory::NAME,
            InboundRecord::ComponentCalls(_) => ComponentCalls::NAME,
            InboundRecord::ServiceTraffic(_) => ServiceTraffic::NAME,
        }
    }
}
