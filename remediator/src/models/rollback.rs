//! Rollback models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::anomaly::Anomaly;

/// The four interchangeable rollback strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    UndoScript,
    PackageDowngrade,
    FileRestore,
    Snapshot,
}

/// Outcome of rolling back one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub target_id: String,
    pub success: bool,
    pub strategy: RollbackStrategy,
    pub message: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Lines of a derived undo script that could not be reversed
    #[serde(default)]
    pub flagged: Vec<String>,
    pub duration_ms: u64,
}

/// Why a rollback was (or was not) requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    CriticalAnomaly,
    MultipleHighAnomalies,
    HighErrorRate,
    Manual,
    Cancelled,
    None,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::CriticalAnomaly => "critical_anomaly",
            RollbackReason::MultipleHighAnomalies => "multiple_high_anomalies",
            RollbackReason::HighErrorRate => "high_error_rate",
            RollbackReason::Manual => "manual",
            RollbackReason::Cancelled => "cancelled",
            RollbackReason::None => "none",
        }
    }
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one decision evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackDecision {
    pub should_rollback: bool,
    pub reason: RollbackReason,
    pub confidence: f64,
    pub anomalies: Vec<Anomaly>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RollbackDecision {
    pub fn no_rollback(message: impl Into<String>) -> Self {
        Self {
            should_rollback: false,
            reason: RollbackReason::None,
            confidence: 0.0,
            anomalies: Vec::new(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
