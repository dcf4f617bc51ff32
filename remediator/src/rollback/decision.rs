//! Rollback decision policy and triggering

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::errors::RemediationError;
use crate::models::anomaly::{Anomaly, Severity};
use crate::models::deployment::Deployment;
use crate::models::rollback::{RollbackDecision, RollbackReason, RollbackResult};
use crate::rollback::executor::{RollbackContext, RollbackExecutor};
use crate::rollback::strategy::select_strategy;
use crate::storage::audit::{AuditEntry, AuditKind};
use crate::storage::deployments::DeploymentRecords;
use crate::storage::inventory::{AssetInventory, PatchStore};

/// Decision thresholds, passed in explicitly at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// When false, every evaluation returns no-rollback
    #[serde(default = "default_true")]
    pub auto_rollback_enabled: bool,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: usize,

    /// Error-rate percentage above which an error-rate anomaly triggers rollback
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_critical_threshold() -> usize {
    1
}

fn default_high_threshold() -> usize {
    3
}

fn default_error_rate_threshold() -> f64 {
    10.0
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            auto_rollback_enabled: true,
            critical_threshold: default_critical_threshold(),
            high_threshold: default_high_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }
}

/// Stateless policy: the verdict depends only on the anomalies and config
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    config: DecisionConfig,
}

impl DecisionPolicy {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Evaluate the rules in order; the first match wins
    pub fn evaluate(&self, deployment_id: &str, anomalies: &[Anomaly]) -> RollbackDecision {
        if !self.config.auto_rollback_enabled {
            return RollbackDecision::no_rollback(format!(
                "automatic rollback disabled for {}",
                deployment_id
            ));
        }

        let count = |severity: Severity| anomalies.iter().filter(|a| a.severity == severity).count();
        let critical = count(Severity::Critical);
        let high = count(Severity::High);

        let verdict = if critical >= self.config.critical_threshold.max(1) {
            Some((
                RollbackReason::CriticalAnomaly,
                1.0,
                format!("{} critical anomalies", critical),
            ))
        } else if high >= self.config.high_threshold.max(1) {
            Some((
                RollbackReason::MultipleHighAnomalies,
                0.9,
                format!("{} high-severity anomalies", high),
            ))
        } else {
            anomalies
                .iter()
                .find(|a| a.is_error_rate() && a.metric_value > self.config.error_rate_threshold)
                .map(|a| {
                    (
                        RollbackReason::HighErrorRate,
                        0.8,
                        format!(
                            "error rate {:.1}% above {:.1}%",
                            a.metric_value, self.config.error_rate_threshold
                        ),
                    )
                })
        };

        match verdict {
            Some((reason, confidence, detail)) => RollbackDecision {
                should_rollback: true,
                reason,
                confidence,
                anomalies: anomalies.to_vec(),
                message: format!("rollback {}: {}", deployment_id, detail),
                timestamp: Utc::now(),
            },
            None => RollbackDecision {
                anomalies: anomalies.to_vec(),
                ..RollbackDecision::no_rollback(format!(
                    "{} anomalies within tolerance for {}",
                    anomalies.len(),
                    deployment_id
                ))
            },
        }
    }
}

/// Applies decisions: drives the deployment through rollback
pub struct RollbackDecisionEngine {
    policy: DecisionPolicy,
    records: Arc<DeploymentRecords>,
    inventory: Arc<dyn AssetInventory>,
    patches: Arc<dyn PatchStore>,
    executor: Arc<RollbackExecutor>,
}

impl RollbackDecisionEngine {
    pub fn new(
        policy: DecisionPolicy,
        records: Arc<DeploymentRecords>,
        inventory: Arc<dyn AssetInventory>,
        patches: Arc<dyn PatchStore>,
        executor: Arc<RollbackExecutor>,
    ) -> Self {
        Self {
            policy,
            records,
            inventory,
            patches,
            executor,
        }
    }

    pub fn evaluate(&self, deployment_id: &str, anomalies: &[Anomaly]) -> RollbackDecision {
        self.policy.evaluate(deployment_id, anomalies)
    }

    /// Roll back every target the deployment touched.
    ///
    /// Returns `Ok(false)` without side effects when the deployment is
    /// already rolled back, or when an automatic trigger is not backed by the
    /// policy. Returns `Ok(true)` only when every target was restored; a
    /// failed rollback leaves the deployment `failed`.
    pub async fn trigger_rollback(
        &self,
        deployment_id: &str,
        anomalies: &[Anomaly],
        manual: bool,
    ) -> Result<bool, RemediationError> {
        let deployment = self.records.get(deployment_id).await?;
        if deployment.status == DeploymentStatus::RolledBack {
            info!("Deployment {} already rolled back, ignoring trigger", deployment_id);
            return Ok(false);
        }

        let decision = if manual {
            RollbackDecision {
                should_rollback: true,
                reason: RollbackReason::Manual,
                confidence: 1.0,
                anomalies: anomalies.to_vec(),
                message: format!("manual rollback of {}", deployment_id),
                timestamp: Utc::now(),
            }
        } else {
            let decision = self.policy.evaluate(deployment_id, anomalies);
            if !decision.should_rollback {
                info!("No rollback for {}: {}", deployment_id, decision.message);
                return Ok(false);
            }
            decision
        };

        let event = DeploymentEvent::RollbackStarted(decision.reason.to_string());
        let recorded = decision.clone();
        let deployment = match self
            .records
            .transition_with(deployment_id, event, move |d| {
                d.last_decision = Some(recorded);
                Ok(())
            })
            .await
        {
            Ok(d) => d,
            Err(RemediationError::InvalidTransition(msg)) => {
                if self.records.get(deployment_id).await?.status == DeploymentStatus::RolledBack {
                    return Ok(false);
                }
                return Err(RemediationError::InvalidTransition(msg));
            }
            Err(e) => return Err(e),
        };
        self.records
            .audit(AuditEntry::new(
                deployment_id,
                AuditKind::Decision,
                json!({
                    "reason": decision.reason,
                    "confidence": decision.confidence,
                    "message": decision.message,
                    "anomalies": decision.anomalies.len(),
                }),
            ))
            .await;

        let targets = deployment.touched_targets();
        warn!(
            "Rolling back deployment {} on {} targets ({})",
            deployment_id,
            targets.len(),
            decision.reason
        );
        let results = self.rollback_targets(&deployment, &targets).await;
        self.finish_rollback(deployment_id, results).await
    }

    /// Record rollback results and land in `rolled_back` or `failed`
    async fn finish_rollback(
        &self,
        deployment_id: &str,
        results: Vec<RollbackResult>,
    ) -> Result<bool, RemediationError> {
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.target_id.clone())
            .collect();

        let event = if failed.is_empty() {
            DeploymentEvent::RollbackCompleted
        } else {
            DeploymentEvent::RollbackFailed(format!(
                "rollback failed on {}; manual intervention required",
                failed.join(", ")
            ))
        };
        self.records
            .transition_with(deployment_id, event, move |d| {
                d.rollback_results = results;
                Ok(())
            })
            .await?;

        if !failed.is_empty() {
            error!("Deployment {} rollback failed on {:?}", deployment_id, failed);
        }
        Ok(failed.is_empty())
    }

    /// Roll back `targets` in parallel and audit each outcome.
    ///
    /// Runs to completion regardless of cancellation.
    pub async fn rollback_targets(
        &self,
        deployment: &Deployment,
        targets: &[String],
    ) -> Vec<RollbackResult> {
        if targets.is_empty() {
            return Vec::new();
        }
        let patch = match self.patches.get_patch(&deployment.patch_id).await {
            Ok(patch) => patch,
            Err(e) => {
                error!("Cannot load patch {} for rollback: {}", deployment.patch_id, e);
                let results: Vec<RollbackResult> = targets
                    .iter()
                    .map(|t| RollbackResult {
                        target_id: t.clone(),
                        success: false,
                        strategy: crate::models::rollback::RollbackStrategy::FileRestore,
                        message: format!("patch unavailable: {}", e),
                        stdout: String::new(),
                        stderr: String::new(),
                        flagged: Vec::new(),
                        duration_ms: 0,
                    })
                    .collect();
                self.audit_results(&deployment.id, &results).await;
                return results;
            }
        };
        let strategy = select_strategy(&patch);

        let tasks = targets.iter().map(|target_id| {
            let patch = &patch;
            async move {
                match self.inventory.get_asset(target_id).await {
                    Ok(asset) => {
                        let ctx = RollbackContext {
                            deployment_id: &deployment.id,
                            backup: deployment.backups.get(target_id),
                        };
                        self.executor.rollback(&asset, patch, ctx).await
                    }
                    Err(e) => RollbackResult {
                        target_id: target_id.clone(),
                        success: false,
                        strategy,
                        message: format!("asset lookup failed: {}", e),
                        stdout: String::new(),
                        stderr: String::new(),
                        flagged: Vec::new(),
                        duration_ms: 0,
                    },
                }
            }
        });
        let results = join_all(tasks).await;
        self.audit_results(&deployment.id, &results).await;
        results
    }

    async fn audit_results(&self, deployment_id: &str, results: &[RollbackResult]) {
        for result in results {
            self.records
                .audit(AuditEntry::new(
                    deployment_id,
                    AuditKind::RollbackOutcome,
                    json!({
                        "target_id": result.target_id,
                        "success": result.success,
                        "strategy": result.strategy,
                        "message": result.message,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                        "flagged": result.flagged,
                        "duration_ms": result.duration_ms,
                    }),
                ))
                .await;
        }
    }
}
