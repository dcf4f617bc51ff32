//! Anomaly detection
//!
//! Three independent rules run on every call and their findings are
//! concatenated: static thresholds, baseline comparison (z-score, or relative
//! deviation when the baseline is flat) and a sustained-memory-pressure
//! pattern. A rule that cannot evaluate a metric skips it.
//!
//! The detector holds no state. Memory samples from earlier calls only count
//! toward the pattern rule when the caller threads a [`PatternHistory`]
//! through [`AnomalyDetector::detect_with_history`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::anomaly::{Anomaly, AnomalyType, Severity};
use crate::models::metric::{self, Metric};

/// High and critical bounds for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub high: f64,
    pub critical: f64,
    /// Low values are bad (e.g. success rate)
    #[serde(default)]
    pub inverted: bool,
}

impl ThresholdRule {
    pub const fn upper(high: f64, critical: f64) -> Self {
        Self {
            high,
            critical,
            inverted: false,
        }
    }

    pub const fn lower(high: f64, critical: f64) -> Self {
        Self {
            high,
            critical,
            inverted: true,
        }
    }

    fn crosses(&self, value: f64, bound: f64) -> bool {
        if self.inverted {
            value < bound
        } else {
            value > bound
        }
    }

    /// Severity of `value`, or `None` when it is within bounds
    pub fn classify(&self, value: f64) -> Option<(Severity, f64)> {
        if self.crosses(value, self.critical) {
            Some((Severity::Critical, self.critical))
        } else if self.crosses(value, self.high) {
            Some((Severity::High, self.high))
        } else {
            None
        }
    }
}

/// Detector configuration, passed in explicitly at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Threshold rules keyed by metric name
    #[serde(default = "default_thresholds")]
    pub thresholds: HashMap<String, ThresholdRule>,

    /// |z| above this is an outlier
    #[serde(default = "default_z_score_threshold")]
    pub z_score_threshold: f64,

    /// |z| above this is a high-severity outlier
    #[serde(default = "default_z_score_high")]
    pub z_score_high: f64,

    /// Relative deviation flagged against a flat baseline
    #[serde(default = "default_deviation_ratio")]
    pub deviation_ratio: f64,

    #[serde(default = "default_memory_leak_percent")]
    pub memory_leak_percent: f64,

    /// Consecutive samples above `memory_leak_percent` that signal a leak
    #[serde(default = "default_memory_leak_run")]
    pub memory_leak_run: usize,

    /// Memory samples kept per series
    #[serde(default = "default_memory_history")]
    pub memory_history: usize,
}

fn default_thresholds() -> HashMap<String, ThresholdRule> {
    HashMap::from([
        (metric::CPU_PERCENT.to_string(), ThresholdRule::upper(80.0, 95.0)),
        (metric::MEMORY_PERCENT.to_string(), ThresholdRule::upper(85.0, 95.0)),
        (metric::DISK_PERCENT.to_string(), ThresholdRule::upper(85.0, 95.0)),
        (metric::ERROR_RATE.to_string(), ThresholdRule::upper(10.0, 25.0)),
        (metric::SUCCESS_RATE.to_string(), ThresholdRule::lower(90.0, 75.0)),
    ])
}

fn default_z_score_threshold() -> f64 {
    3.0
}

fn default_z_score_high() -> f64 {
    4.0
}

fn default_deviation_ratio() -> f64 {
    0.2
}

fn default_memory_leak_percent() -> f64 {
    80.0
}

fn default_memory_leak_run() -> usize {
    3
}

fn default_memory_history() -> usize {
    32
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            z_score_threshold: default_z_score_threshold(),
            z_score_high: default_z_score_high(),
            deviation_ratio: default_deviation_ratio(),
            memory_leak_percent: default_memory_leak_percent(),
            memory_leak_run: default_memory_leak_run(),
            memory_history: default_memory_history(),
        }
    }
}

/// Memory samples per target, owned by one observer of a deployment
#[derive(Debug, Default, Clone)]
pub struct PatternHistory {
    memory: HashMap<String, VecDeque<f64>>,
}

impl PatternHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory samples remembered for `target_id`
    pub fn samples(&self, target_id: &str) -> usize {
        self.memory.get(target_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

/// Mean and sample standard deviation
fn mean_stddev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() == 1 {
        return Some((mean, 0.0));
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, variance.sqrt()))
}

pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run every rule over `current`, comparing against `baseline` when given.
    ///
    /// The pattern rule only sees the memory samples inside `current`.
    pub fn detect(&self, current: &[Metric], baseline: Option<&[Metric]>) -> Vec<Anomaly> {
        self.detect_with_history(current, baseline, &mut PatternHistory::new())
    }

    /// Like [`detect`](Self::detect), with memory samples of earlier calls
    /// taken from and appended to `history`
    pub fn detect_with_history(
        &self,
        current: &[Metric],
        baseline: Option<&[Metric]>,
        history: &mut PatternHistory,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for m in current {
            if !m.value.is_finite() {
                warn!("Skipping malformed metric {} = {}", m.name, m.value);
                continue;
            }
            if let Some(a) = self.check_threshold(m) {
                anomalies.push(a);
            }
            if let Some(baseline) = baseline {
                if let Some(a) = self.check_baseline(m, baseline) {
                    anomalies.push(a);
                }
            }
        }
        anomalies.extend(self.check_memory_pattern(current, history));

        if !anomalies.is_empty() {
            debug!(
                "Detected {} anomalies across {} metrics",
                anomalies.len(),
                current.len()
            );
        }
        anomalies
    }

    fn check_threshold(&self, m: &Metric) -> Option<Anomaly> {
        let rule = self.config.thresholds.get(&m.name)?;
        let (severity, bound) = rule.classify(m.value)?;
        let direction = if rule.inverted { "below" } else { "above" };
        let confidence = if severity == Severity::Critical { 1.0 } else { 0.8 };

        Some(anomaly(
            AnomalyType::Threshold,
            severity,
            m,
            bound,
            format!(
                "{} = {:.2} is {} the {:?} bound {:.2}",
                m.name, m.value, direction, severity, bound
            ),
            confidence,
        ))
    }

    fn check_baseline(&self, m: &Metric, baseline: &[Metric]) -> Option<Anomaly> {
        // Running totals drift away from any earlier sample
        if m.is_counter() {
            return None;
        }
        let values: Vec<f64> = baseline
            .iter()
            .filter(|b| b.name == m.name && b.target_id() == m.target_id())
            .map(|b| b.value)
            .filter(|v| v.is_finite())
            .collect();
        let (mean, stddev) = mean_stddev(&values)?;

        if stddev == 0.0 {
            if mean == 0.0 {
                return None;
            }
            let deviation = (m.value - mean).abs() / mean.abs();
            if deviation < self.config.deviation_ratio {
                return None;
            }
            return Some(anomaly(
                AnomalyType::BaselineDeviation,
                Severity::Medium,
                m,
                mean,
                format!(
                    "{} = {:.2} deviates {:.0}% from flat baseline {:.2}",
                    m.name,
                    m.value,
                    deviation * 100.0,
                    mean
                ),
                deviation.min(1.0),
            ));
        }

        let z = (m.value - mean) / stddev;
        if z.abs() <= self.config.z_score_threshold {
            return None;
        }
        let severity = if z.abs() <= self.config.z_score_high {
            Severity::Medium
        } else {
            Severity::High
        };
        Some(anomaly(
            AnomalyType::StatisticalOutlier,
            severity,
            m,
            mean + self.config.z_score_threshold * stddev * z.signum(),
            format!(
                "{} = {:.2} is {:.1} standard deviations from baseline mean {:.2}",
                m.name, m.value, z, mean
            ),
            (z.abs() / 5.0).min(1.0),
        ))
    }

    fn check_memory_pattern(&self, current: &[Metric], history: &mut PatternHistory) -> Vec<Anomaly> {
        let run = self.config.memory_leak_run.max(1);
        let cap = self.config.memory_history.max(run);
        let mut found = Vec::new();

        for m in current
            .iter()
            .filter(|m| m.name == metric::MEMORY_PERCENT && m.value.is_finite())
        {
            let series = history
                .memory
                .entry(m.target_id().unwrap_or_default().to_string())
                .or_default();
            series.push_back(m.value);
            while series.len() > cap {
                series.pop_front();
            }

            let sustained = series.len() >= run
                && series
                    .iter()
                    .rev()
                    .take(run)
                    .all(|v| *v > self.config.memory_leak_percent);
            if sustained {
                found.push(anomaly(
                    AnomalyType::MemoryLeak,
                    Severity::High,
                    m,
                    self.config.memory_leak_percent,
                    format!(
                        "memory above {:.0}% for {} consecutive samples",
                        self.config.memory_leak_percent, run
                    ),
                    0.7,
                ));
            }
        }
        found
    }
}

fn anomaly(
    anomaly_type: AnomalyType,
    severity: Severity,
    m: &Metric,
    threshold: f64,
    message: String,
    confidence: f64,
) -> Anomaly {
    let labels: BTreeMap<String, String> = m.labels.clone();
    Anomaly {
        anomaly_type,
        severity,
        metric_name: m.name.clone(),
        metric_value: m.value,
        threshold,
        message,
        timestamp: Utc::now(),
        labels,
        confidence,
    }
}
