//! Anomaly models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which rule produced the anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// Static high/critical bound crossed
    Threshold,
    /// Z-score outlier against the baseline distribution
    StatisticalOutlier,
    /// Relative deviation from a flat baseline
    BaselineDeviation,
    /// Sustained memory pressure across consecutive samples
    MemoryLeak,
}

/// Ordered severity, `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Points subtracted from a 100-point health score
    pub fn health_penalty(&self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 10,
            Severity::High => 20,
            Severity::Critical => 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// In `[0, 1]`
    pub confidence: f64,
}

impl Anomaly {
    pub fn is_error_rate(&self) -> bool {
        self.metric_name.contains("error_rate")
    }
}
