//! Post-phase health monitoring

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::cancel::CancelToken;
use crate::detect::{AnomalyDetector, PatternHistory};
use crate::models::anomaly::Anomaly;
use crate::models::metric::{Metric, LABEL_DEPLOYMENT};
use crate::models::rollback::RollbackDecision;
use crate::rollback::DecisionPolicy;
use crate::storage::audit::{AuditEntry, AuditKind};
use crate::storage::deployments::DeploymentRecords;
use crate::telemetry::MetricsCollector;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Time between samples
    pub interval: Duration,
    /// Default observation window after a phase
    pub window: Duration,
    /// Shorter window used between rolling batches
    pub health_check: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(300),
            health_check: Duration::from_secs(30),
        }
    }
}

/// What one monitoring window observed
#[derive(Debug, Clone)]
pub struct MonitorReport {
    /// Every anomaly seen in the window, across ticks
    pub anomalies: Vec<Anomaly>,
    /// Verdict on the last tick; its anomalies are that tick's batch
    pub decision: RollbackDecision,
    /// Latest metrics collected
    pub metrics: Vec<Metric>,
    pub ticks: u32,
    pub cancelled: bool,
}

pub struct Monitor {
    collector: Arc<MetricsCollector>,
    detector: Arc<AnomalyDetector>,
    policy: DecisionPolicy,
    records: Arc<DeploymentRecords>,
    options: MonitorOptions,
}

impl Monitor {
    pub fn new(
        collector: Arc<MetricsCollector>,
        detector: Arc<AnomalyDetector>,
        policy: DecisionPolicy,
        records: Arc<DeploymentRecords>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            collector,
            detector,
            policy,
            records,
            options,
        }
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// One sampling pass: metrics of every target plus the deployment itself
    pub async fn sample(
        &self,
        deployment_id: &str,
        targets: &[String],
        baseline: &BTreeMap<String, Vec<Metric>>,
        history: &mut PatternHistory,
    ) -> (Vec<Metric>, Vec<Anomaly>) {
        let tasks = targets.iter().map(|target_id| async move {
            match self.collector.collect_system(target_id).await {
                Ok(metrics) => metrics
                    .into_iter()
                    .map(|m| m.with_label(LABEL_DEPLOYMENT, deployment_id))
                    .collect(),
                Err(e) => {
                    warn!("Monitoring sample of {} failed: {}", target_id, e);
                    Vec::new()
                }
            }
        });
        let per_target: Vec<Vec<Metric>> = join_all(tasks).await;

        let mut metrics = Vec::new();
        let mut anomalies = Vec::new();
        for (target_id, current) in targets.iter().zip(per_target) {
            let reference = baseline.get(target_id).map(Vec::as_slice);
            anomalies.extend(self.detector.detect_with_history(&current, reference, history));
            metrics.extend(current);
        }

        match self.collector.collect_deployment(deployment_id).await {
            Ok(current) => {
                anomalies.extend(self.detector.detect(&current, None));
                metrics.extend(current);
            }
            Err(e) => warn!("Deployment metrics of {} unavailable: {}", deployment_id, e),
        }
        (metrics, anomalies)
    }

    /// Observe `targets` for `wait`, sampling at least once.
    ///
    /// Each tick's batch is judged on its own. Returns as soon as a batch
    /// calls for a rollback, or when `cancel` fires. `history` carries
    /// memory samples across ticks and across calls of the same run.
    pub async fn watch(
        &self,
        deployment_id: &str,
        targets: &[String],
        baseline: &BTreeMap<String, Vec<Metric>>,
        wait: Duration,
        cancel: &CancelToken,
        history: &mut PatternHistory,
    ) -> MonitorReport {
        let deadline = Instant::now() + wait;
        let mut anomalies: Vec<Anomaly> = Vec::new();
        let mut ticks = 0u32;

        info!(
            "Monitoring {} targets of {} for {:?}",
            targets.len(),
            deployment_id,
            wait
        );

        loop {
            let (metrics, found) = self.sample(deployment_id, targets, baseline, history).await;
            ticks += 1;

            if !found.is_empty() {
                warn!(
                    "Tick {} of {} found {} anomalies",
                    ticks,
                    deployment_id,
                    found.len()
                );
                self.records
                    .audit(AuditEntry::new(
                        deployment_id,
                        AuditKind::AnomalyBatch,
                        json!({ "tick": ticks, "anomalies": found }),
                    ))
                    .await;
            }

            let decision = self.policy.evaluate(deployment_id, &found);
            anomalies.extend(found);
            if decision.should_rollback {
                info!("Monitoring of {} stopped early: {}", deployment_id, decision.message);
                return MonitorReport {
                    anomalies,
                    decision,
                    metrics,
                    ticks,
                    cancelled: false,
                };
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Monitoring window of {} elapsed after {} ticks", deployment_id, ticks);
                return MonitorReport {
                    anomalies,
                    decision,
                    metrics,
                    ticks,
                    cancelled: false,
                };
            }

            let pause = self.options.interval.min(deadline - now);
            if !cancel.sleep(pause).await {
                return MonitorReport {
                    anomalies,
                    decision,
                    metrics,
                    ticks,
                    cancelled: true,
                };
            }
        }
    }
}
