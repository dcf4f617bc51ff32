//! Metric samples

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CPU_PERCENT: &str = "cpu_percent";
pub const MEMORY_PERCENT: &str = "memory_percent";
pub const MEMORY_AVAILABLE_BYTES: &str = "memory_available_bytes";
pub const DISK_PERCENT: &str = "disk_percent";
pub const DISK_FREE_BYTES: &str = "disk_free_bytes";
pub const NETWORK_BYTES_SENT: &str = "network_bytes_sent";
pub const NETWORK_BYTES_RECV: &str = "network_bytes_recv";

pub const DEPLOYMENT_STATUS_CODE: &str = "deployment_status_code";
pub const SUCCESS_RATE: &str = "success_rate";
pub const ERROR_RATE: &str = "error_rate";
pub const TOTAL_TARGETS: &str = "total_targets";
pub const SUCCEEDED_TARGETS: &str = "succeeded_targets";
pub const FAILED_TARGETS: &str = "failed_targets";

/// Running totals since boot rather than point-in-time readings
pub const COUNTERS: &[&str] = &[NETWORK_BYTES_SENT, NETWORK_BYTES_RECV];

pub const LABEL_TARGET: &str = "target_id";
pub const LABEL_DEPLOYMENT: &str = "deployment_id";

/// Where a metric comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    System,
    Deployment,
    Application,
}

/// One immutable sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub metric_type: MetricType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub unit: String,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        metric_type: MetricType,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            metric_type,
            timestamp,
            labels: BTreeMap::new(),
            unit: unit.into(),
        }
    }

    /// Builder-style label setter
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn target_id(&self) -> Option<&str> {
        self.label(LABEL_TARGET)
    }

    /// Whether the value only ever grows between samples
    pub fn is_counter(&self) -> bool {
        COUNTERS.contains(&self.name.as_str())
    }
}
