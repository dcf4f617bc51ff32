//! Deployment executor
//!
//! Drives one deployment from `pending` to a terminal state: pre-check,
//! baseline, phased rollout with monitoring between phases, and rollback
//! when the decision policy calls for it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::deploy::cancel::CancelToken;
use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::deploy::monitor::Monitor;
use crate::deploy::strategy::{plan_phases, validate_params, PhasePlan};
use crate::deploy::worker::{run_phase, TargetWorker};
use crate::detect::PatternHistory;
use crate::errors::RemediationError;
use crate::models::anomaly::Anomaly;
use crate::models::deployment::{Deployment, PhaseResult, PreCheckResult, Strategy};
use crate::models::metric::Metric;
use crate::models::patch::{Patch, PatchStatus, PatchType};
use crate::models::rollback::{RollbackDecision, RollbackReason};
use crate::rollback::RollbackDecisionEngine;
use crate::storage::audit::{AuditEntry, AuditKind};
use crate::storage::deployments::DeploymentRecords;
use crate::storage::inventory::{AssetInventory, PatchStore};
use crate::telemetry::MetricsCollector;

/// Final report of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub summary: String,
    pub anomalies: Vec<Anomaly>,
    /// Metrics of the last monitoring sample
    pub metrics: Vec<Metric>,
    pub decision: Option<RollbackDecision>,
}

/// How the phase loop ended
enum RunEnd {
    Completed,
    Halted(String),
    RollbackTriggered,
    Cancelled,
}

/// Observations carried across phases
#[derive(Default)]
struct RunLog {
    anomalies: Vec<Anomaly>,
    history: PatternHistory,
    metrics: Vec<Metric>,
    decision: Option<RollbackDecision>,
}

pub struct DeploymentExecutor {
    records: Arc<DeploymentRecords>,
    inventory: Arc<dyn AssetInventory>,
    patches: Arc<dyn PatchStore>,
    worker: Arc<TargetWorker>,
    collector: Arc<MetricsCollector>,
    monitor: Monitor,
    engine: Arc<RollbackDecisionEngine>,
}

impl DeploymentExecutor {
    pub fn new(
        records: Arc<DeploymentRecords>,
        inventory: Arc<dyn AssetInventory>,
        patches: Arc<dyn PatchStore>,
        worker: Arc<TargetWorker>,
        collector: Arc<MetricsCollector>,
        monitor: Monitor,
        engine: Arc<RollbackDecisionEngine>,
    ) -> Self {
        Self {
            records,
            inventory,
            patches,
            worker,
            collector,
            monitor,
            engine,
        }
    }

    /// Run a pending deployment to completion.
    ///
    /// Only a deployment in `pending` can be executed. Errors after the run
    /// has started are recorded on the deployment, which lands in `failed`.
    pub async fn execute(
        &self,
        deployment_id: &str,
        cancel: &CancelToken,
    ) -> Result<DeploymentOutcome, RemediationError> {
        let deployment = self.records.get(deployment_id).await?;
        if deployment.status != DeploymentStatus::Pending {
            return Err(RemediationError::InvalidTransition(format!(
                "deployment {} is {}, only pending deployments can execute",
                deployment_id, deployment.status
            )));
        }
        info!(
            "Executing deployment {} of patch {} on {} targets ({})",
            deployment_id,
            deployment.patch_id,
            deployment.target_ids.len(),
            deployment.strategy
        );

        let mut log = RunLog::default();
        if let Err(e) = self.drive(&deployment, cancel, &mut log).await {
            error!("Deployment {} aborted: {}", deployment_id, e);
            self.fail_if_running(deployment_id, e.to_string()).await;
        }

        let summary = self.summarize(deployment_id, &log).await?;
        let deployment = self.records.get(deployment_id).await?;

        info!("Deployment {} finished as {}", deployment_id, deployment.status);
        Ok(DeploymentOutcome {
            deployment_id: deployment_id.to_string(),
            status: deployment.status,
            summary,
            anomalies: log.anomalies,
            metrics: log.metrics,
            decision: log.decision,
        })
    }

    async fn drive(
        &self,
        deployment: &Deployment,
        cancel: &CancelToken,
        log: &mut RunLog,
    ) -> Result<(), RemediationError> {
        let id = deployment.id.as_str();
        self.records.transition(id, DeploymentEvent::BeginPreCheck).await?;

        let (check, plan) = self.pre_check(deployment).await;
        let passed = check.passed;
        let reason = check.errors.join("; ");
        self.records
            .update(id, move |d| {
                d.pre_check = Some(check);
                Ok(())
            })
            .await?;

        let Some((patch, phases)) = plan.filter(|_| passed) else {
            warn!("Pre-check of {} failed: {}", id, reason);
            self.records
                .transition(id, DeploymentEvent::PreCheckFailed(reason.clone()))
                .await?;
            self.records
                .transition(id, DeploymentEvent::Fail(format!("pre-check failed: {}", reason)))
                .await?;
            return Ok(());
        };
        self.records.transition(id, DeploymentEvent::PreCheckPassed).await?;

        if cancel.is_cancelled() {
            self.records.transition(id, DeploymentEvent::Cancel).await?;
            return Ok(());
        }

        let baseline = self
            .collector
            .collect_baseline(&deployment.target_ids, Some(cancel))
            .await;
        let stored = baseline.clone();
        self.records
            .update(id, move |d| {
                d.baseline = stored;
                Ok(())
            })
            .await?;

        if cancel.is_cancelled() {
            self.records.transition(id, DeploymentEvent::Cancel).await?;
            return Ok(());
        }

        self.records.transition(id, DeploymentEvent::StartDeploying).await?;
        let end = self
            .run_phases(deployment, Arc::new(patch), &phases, &baseline, cancel, log)
            .await?;

        match end {
            RunEnd::Completed => {
                let blue_green = deployment.strategy == Strategy::BlueGreen;
                self.records
                    .transition_with(id, DeploymentEvent::Succeed, move |d| {
                        d.cutover_ready = blue_green;
                        Ok(())
                    })
                    .await?;
                if blue_green {
                    info!("Green set of {} validated, ready for cutover", id);
                }
            }
            RunEnd::Halted(reason) => {
                self.records.transition(id, DeploymentEvent::Fail(reason)).await?;
            }
            RunEnd::RollbackTriggered => {}
            RunEnd::Cancelled => self.unwind_cancelled(id).await?,
        }
        Ok(())
    }

    /// Validate the patch, request and targets; on success also return the plan
    async fn pre_check(&self, deployment: &Deployment) -> (PreCheckResult, Option<(Patch, Vec<PhasePlan>)>) {
        let mut errors = Vec::new();

        let patch = match self.patches.get_patch(&deployment.patch_id).await {
            Ok(patch) => {
                if patch.status != PatchStatus::Approved {
                    errors.push(format!("patch {} is not approved ({:?})", patch.id, patch.status));
                }
                if patch.patch_type == PatchType::Manual {
                    errors.push(format!("patch {} requires manual application", patch.id));
                }
                if patch.content.trim().is_empty() {
                    errors.push(format!("patch {} has no content", patch.id));
                }
                Some(patch)
            }
            Err(e) => {
                errors.push(format!("patch {} unavailable: {}", deployment.patch_id, e));
                None
            }
        };

        errors.extend(validate_params(
            deployment.strategy,
            &deployment.params,
            &deployment.target_ids,
        ));

        for target_id in &deployment.target_ids {
            if let Err(e) = self.inventory.get_asset(target_id).await {
                errors.push(format!("target {} unavailable: {}", target_id, e));
            }
        }

        let plan = if errors.is_empty() {
            match plan_phases(deployment.strategy, &deployment.params, &deployment.target_ids) {
                Ok(phases) => patch.map(|p| (p, phases)),
                Err(e) => {
                    errors.push(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        let result = PreCheckResult {
            passed: errors.is_empty(),
            errors,
            checked_at: Utc::now(),
        };
        (result, plan)
    }

    fn monitoring_wait(&self, deployment: &Deployment) -> Duration {
        let options = self.monitor.options();
        match deployment.strategy {
            Strategy::Rolling => options.health_check,
            _ => deployment
                .params
                .wait_secs
                .map(Duration::from_secs)
                .unwrap_or(options.window),
        }
    }

    async fn run_phases(
        &self,
        deployment: &Deployment,
        patch: Arc<Patch>,
        phases: &[PhasePlan],
        baseline: &BTreeMap<String, Vec<Metric>>,
        cancel: &CancelToken,
        log: &mut RunLog,
    ) -> Result<RunEnd, RemediationError> {
        let id = deployment.id.as_str();
        let wait = self.monitoring_wait(deployment);

        for phase in phases {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            info!(
                "Deployment {} phase {} ({} new targets)",
                id,
                phase.label,
                phase.targets.len()
            );

            if let Some(percentage) = phase.percentage {
                let index = phase.index;
                let wait_secs = wait.as_secs();
                self.records
                    .update(id, move |d| {
                        d.canary_percentage = Some(percentage);
                        d.canary_phase = Some(index);
                        d.canary_wait_secs = Some(wait_secs);
                        Ok(())
                    })
                    .await?;
            }

            let started_at = Utc::now();
            let concurrency = deployment
                .params
                .max_concurrency
                .unwrap_or(phase.targets.len());
            let targets = run_phase(
                Arc::clone(&self.worker),
                id,
                Arc::clone(&patch),
                &phase.targets,
                concurrency,
                cancel,
            )
            .await;

            let result = PhaseResult {
                index: phase.index,
                label: phase.label.clone(),
                percentage: phase.percentage,
                targets,
                anomalies: Vec::new(),
                started_at,
                completed_at: Utc::now(),
            };
            let failure_rate = result.failure_rate();
            let audit = json!({
                "index": result.index,
                "label": result.label,
                "targets": result.targets.iter().map(|t| (&t.target_id, t.outcome)).collect::<Vec<_>>(),
                "failure_rate": failure_rate,
            });
            let updated = self
                .records
                .update(id, move |d| {
                    d.phases.push(result);
                    Ok(d.clone())
                })
                .await?;
            self.records
                .audit(AuditEntry::new(id, AuditKind::PhaseCompleted, audit))
                .await;

            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }

            if failure_rate > deployment.params.max_failure_rate {
                return Ok(RunEnd::Halted(format!(
                    "phase {} failure rate {:.0}% exceeds tolerated {:.0}%",
                    phase.label,
                    failure_rate * 100.0,
                    deployment.params.max_failure_rate * 100.0
                )));
            }

            let watched = updated.touched_targets();
            let report = self
                .monitor
                .watch(id, &watched, baseline, wait, cancel, &mut log.history)
                .await;

            let phase_anomalies = report.anomalies.clone();
            let decision = report.decision.clone();
            self.records
                .update(id, move |d| {
                    if let Some(last) = d.phases.last_mut() {
                        last.anomalies = phase_anomalies;
                    }
                    d.last_decision = Some(decision);
                    Ok(())
                })
                .await?;

            log.anomalies.extend(report.anomalies.iter().cloned());
            log.metrics = report.metrics;
            log.decision = Some(report.decision.clone());

            if report.cancelled {
                return Ok(RunEnd::Cancelled);
            }
            if report.decision.should_rollback {
                warn!("Deployment {} rolling back after {}: {}", id, phase.label, report.decision.message);
                self.engine
                    .trigger_rollback(id, &report.decision.anomalies, false)
                    .await?;
                if self.records.get(id).await?.status == DeploymentStatus::Deploying {
                    return Ok(RunEnd::Halted(format!(
                        "rollback requested after {} but not started",
                        phase.label
                    )));
                }
                return Ok(RunEnd::RollbackTriggered);
            }
        }
        Ok(RunEnd::Completed)
    }

    /// Revert touched targets after a cancellation, then settle the record
    async fn unwind_cancelled(&self, deployment_id: &str) -> Result<(), RemediationError> {
        let deployment = self.records.get(deployment_id).await?;
        let touched = deployment.touched_targets();
        if touched.is_empty() {
            self.records.transition(deployment_id, DeploymentEvent::Cancel).await?;
            return Ok(());
        }

        warn!(
            "Deployment {} cancelled, reverting {} touched targets",
            deployment_id,
            touched.len()
        );
        let results = self.engine.rollback_targets(&deployment, &touched).await;
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.target_id.clone())
            .collect();

        let event = if failed.is_empty() {
            DeploymentEvent::Cancel
        } else {
            DeploymentEvent::Fail(format!(
                "cancelled; rollback failed on {}",
                failed.join(", ")
            ))
        };
        let restored = failed.is_empty();
        self.records
            .transition_with(deployment_id, event, move |d| {
                d.rollback_reason = Some(RollbackReason::Cancelled.to_string());
                d.rollback_started_at = Some(Utc::now());
                d.rollback_completed_at = Some(Utc::now());
                d.rolled_back = restored;
                d.rollback_results = results;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn fail_if_running(&self, deployment_id: &str, message: String) {
        let status = match self.records.get(deployment_id).await {
            Ok(d) => d.status,
            Err(_) => return,
        };
        let steps: Vec<DeploymentEvent> = match status {
            DeploymentStatus::PreCheckRunning => vec![
                DeploymentEvent::PreCheckFailed(message.clone()),
                DeploymentEvent::Fail(message),
            ],
            DeploymentStatus::PreCheckFailed | DeploymentStatus::Deploying => {
                vec![DeploymentEvent::Fail(message)]
            }
            DeploymentStatus::RollingBack => vec![DeploymentEvent::RollbackFailed(message)],
            DeploymentStatus::PreCheckPassed => vec![DeploymentEvent::Cancel],
            _ => Vec::new(),
        };
        for event in steps {
            if let Err(e) = self.records.transition(deployment_id, event).await {
                error!("Could not settle deployment {}: {}", deployment_id, e);
                return;
            }
        }
    }

    /// Build and store the human-readable summary
    async fn summarize(&self, deployment_id: &str, log: &RunLog) -> Result<String, RemediationError> {
        let anomaly_count = log.anomalies.len();
        self.records
            .update(deployment_id, move |d| {
                let summary = summary_text(d, anomaly_count);
                d.summary = Some(summary.clone());
                Ok(summary)
            })
            .await
    }
}

fn list(ids: &[String]) -> String {
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}

/// Summary of a deployment's final state
pub fn summary_text(deployment: &Deployment, anomaly_count: usize) -> String {
    let succeeded = deployment.succeeded_targets();
    let failed = deployment.failed_targets();
    let untouched = deployment.not_attempted_targets();

    let mut lines = vec![
        format!(
            "Deployment {} of patch {} ({}) ended {}",
            deployment.id, deployment.patch_id, deployment.strategy, deployment.status
        ),
        format!("Phases completed: {}", deployment.phases.len()),
        format!("Succeeded ({}): {}", succeeded.len(), list(&succeeded)),
        format!("Failed ({}): {}", failed.len(), list(&failed)),
        format!("Not attempted ({}): {}", untouched.len(), list(&untouched)),
        format!("Anomalies detected: {}", anomaly_count),
    ];
    if let Some(reason) = &deployment.rollback_reason {
        lines.push(format!(
            "Rollback ({}): restored {}",
            reason,
            list(&deployment.rolled_back_targets())
        ));
    }
    if deployment.cutover_ready {
        lines.push("Green set ready for cutover".to_string());
    }
    if let Some(err) = &deployment.error {
        lines.push(format!("Error: {}", err));
    }
    lines.join("\n")
}
