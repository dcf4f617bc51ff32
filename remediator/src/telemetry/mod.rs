//! Metrics collection
//!
//! Every call produces a fresh set of immutable samples stamped with the call
//! time. Callers poll; nothing streams.

pub mod probe;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::deploy::cancel::CancelToken;
use crate::errors::RemediationError;
use crate::models::deployment::{Deployment, TargetOutcome};
use crate::models::metric::{self, Metric, MetricType, LABEL_DEPLOYMENT, LABEL_TARGET};
use crate::storage::deployments::DeploymentRecords;

pub use probe::{LocalProbe, RemoteProbe, SystemProbe, SystemSample};

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Snapshots per target in a baseline
    pub baseline_samples: usize,
    pub baseline_interval: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            baseline_samples: 3,
            baseline_interval: Duration::from_secs(5),
        }
    }
}

/// Turn one host sample into labeled metrics
pub fn system_metrics(target_id: &str, sample: &SystemSample) -> Vec<Metric> {
    let now = Utc::now();
    let percent = |name: &str, value: f64| {
        Metric::new(name, value, MetricType::System, "percent", now).with_label(LABEL_TARGET, target_id)
    };
    let bytes = |name: &str, value: u64| {
        Metric::new(name, value as f64, MetricType::System, "bytes", now).with_label(LABEL_TARGET, target_id)
    };
    vec![
        percent(metric::CPU_PERCENT, sample.cpu_percent),
        percent(metric::MEMORY_PERCENT, sample.memory_percent),
        bytes(metric::MEMORY_AVAILABLE_BYTES, sample.memory_available_bytes),
        percent(metric::DISK_PERCENT, sample.disk_percent),
        bytes(metric::DISK_FREE_BYTES, sample.disk_free_bytes),
        bytes(metric::NETWORK_BYTES_SENT, sample.network_bytes_sent),
        bytes(metric::NETWORK_BYTES_RECV, sample.network_bytes_recv),
    ]
}

/// Progress metrics of one deployment; rates are percentages of attempted targets
pub fn deployment_metrics(deployment: &Deployment) -> Vec<Metric> {
    let now = Utc::now();
    let succeeded = deployment
        .target_results()
        .filter(|t| t.outcome == TargetOutcome::Succeeded)
        .count();
    let failed = deployment.target_results().filter(|t| t.outcome.failed()).count();
    let attempted = succeeded + failed;
    let (success_rate, error_rate) = if attempted == 0 {
        (100.0, 0.0)
    } else {
        (
            succeeded as f64 / attempted as f64 * 100.0,
            failed as f64 / attempted as f64 * 100.0,
        )
    };

    let gauge = |name: &str, value: f64, unit: &str| {
        Metric::new(name, value, MetricType::Deployment, unit, now)
            .with_label(LABEL_DEPLOYMENT, deployment.id.as_str())
    };
    vec![
        gauge(metric::DEPLOYMENT_STATUS_CODE, deployment.status.code() as f64, "code"),
        gauge(metric::SUCCESS_RATE, success_rate, "percent"),
        gauge(metric::ERROR_RATE, error_rate, "percent"),
        gauge(metric::TOTAL_TARGETS, deployment.target_ids.len() as f64, "count"),
        gauge(metric::SUCCEEDED_TARGETS, succeeded as f64, "count"),
        gauge(metric::FAILED_TARGETS, failed as f64, "count"),
    ]
}

pub struct MetricsCollector {
    probe: Arc<dyn SystemProbe>,
    records: Arc<DeploymentRecords>,
    options: CollectorOptions,
}

impl MetricsCollector {
    pub fn new(probe: Arc<dyn SystemProbe>, records: Arc<DeploymentRecords>, options: CollectorOptions) -> Self {
        Self {
            probe,
            records,
            options,
        }
    }

    /// CPU, memory, disk and network metrics of one target
    pub async fn collect_system(&self, target_id: &str) -> Result<Vec<Metric>, RemediationError> {
        let sample = self.probe.sample(target_id).await?;
        debug!("Sampled {}: {:?}", target_id, sample);
        Ok(system_metrics(target_id, &sample))
    }

    /// Status and target counters of one deployment
    pub async fn collect_deployment(&self, deployment_id: &str) -> Result<Vec<Metric>, RemediationError> {
        let deployment = self.records.get(deployment_id).await?;
        Ok(deployment_metrics(&deployment))
    }

    /// Pre-change samples per target.
    ///
    /// A target that cannot be sampled keeps whatever was collected so far,
    /// possibly nothing; baseline rules then skip it.
    pub async fn collect_baseline(
        &self,
        target_ids: &[String],
        cancel: Option<&CancelToken>,
    ) -> BTreeMap<String, Vec<Metric>> {
        let samples = self.options.baseline_samples.max(1);
        let tasks = target_ids.iter().map(|target_id| async move {
            let mut metrics = Vec::new();
            for i in 0..samples {
                if i > 0 {
                    let keep_going = match cancel {
                        Some(token) => token.sleep(self.options.baseline_interval).await,
                        None => {
                            tokio::time::sleep(self.options.baseline_interval).await;
                            true
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
                match self.collect_system(target_id).await {
                    Ok(sample) => metrics.extend(sample),
                    Err(e) => {
                        warn!("Baseline sample of {} failed: {}", target_id, e);
                        break;
                    }
                }
            }
            (target_id.clone(), metrics)
        });
        join_all(tasks).await.into_iter().collect()
    }
}
