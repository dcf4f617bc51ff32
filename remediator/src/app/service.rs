//! Service facade over the engine

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::state::EngineState;
use crate::deploy::executor::DeploymentOutcome;
use crate::deploy::fsm::DeploymentStatus;
use crate::errors::RemediationError;
use crate::models::anomaly::Anomaly;
use crate::models::deployment::{Deployment, DeploymentSnapshot, Strategy, StrategyParams};
use crate::models::metric::{Metric, LABEL_DEPLOYMENT};
use crate::models::rollback::RollbackDecision;

/// Request to roll a patch out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub patch_id: String,
    pub target_ids: Vec<String>,
    pub strategy: Strategy,
    #[serde(default)]
    pub params: StrategyParams,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Answer to a rollback request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAck {
    pub accepted: bool,
    pub message: String,
    /// Deployment status once the request was handled
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
}

impl RollbackAck {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            status: None,
        }
    }
}

/// On-demand health check of one deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub deployment_id: String,
    /// 0 (unhealthy) to 100 (healthy)
    pub health_score: u32,
    pub anomalies: Vec<Anomaly>,
    pub metrics: Vec<Metric>,
    pub decision: RollbackDecision,
    pub evaluated_at: DateTime<Utc>,
}

/// 100 minus the severity penalties, floored at 0
pub fn health_score(anomalies: &[Anomaly]) -> u32 {
    let penalty: u32 = anomalies.iter().map(|a| a.severity.health_penalty()).sum();
    100u32.saturating_sub(penalty)
}

#[derive(Clone)]
pub struct RemediationService {
    state: Arc<EngineState>,
}

impl RemediationService {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Record a pending deployment; nothing runs until `execute`
    pub async fn start_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentSnapshot, RemediationError> {
        if request.target_ids.is_empty() {
            return Err(RemediationError::ValidationError(
                "deployment needs at least one target".to_string(),
            ));
        }
        let mut deployment = Deployment::new(
            request.patch_id,
            request.target_ids,
            request.strategy,
            request.params,
        );
        deployment.scheduled_at = request.scheduled_at;
        self.state.records.create(&deployment).await?;

        info!(
            "Created deployment {} of patch {} ({}, {} targets)",
            deployment.id,
            deployment.patch_id,
            deployment.strategy,
            deployment.target_ids.len()
        );
        Ok(deployment.snapshot())
    }

    /// Run a pending deployment; a concurrent second call is rejected
    pub async fn execute(&self, deployment_id: &str) -> Result<DeploymentOutcome, RemediationError> {
        let guard = self.state.inflight.acquire(deployment_id)?;
        let token = guard.token();
        self.state.executor.execute(deployment_id, &token).await
    }

    pub async fn get_deployment_state(
        &self,
        deployment_id: &str,
    ) -> Result<DeploymentSnapshot, RemediationError> {
        Ok(self.state.records.get(deployment_id).await?.snapshot())
    }

    /// Manually roll back every target the deployment touched
    pub async fn request_rollback(&self, deployment_id: &str, reason: &str) -> RollbackAck {
        let _guard = match self.state.inflight.acquire(deployment_id) {
            Ok(guard) => guard,
            Err(_) => {
                return RollbackAck::rejected(format!(
                    "deployment {} is executing; cancel it first",
                    deployment_id
                ))
            }
        };
        let deployment = match self.state.records.get(deployment_id).await {
            Ok(d) => d,
            Err(e) => return RollbackAck::rejected(e.to_string()),
        };
        match deployment.status {
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Deploying => {}
            DeploymentStatus::RolledBack => {
                return RollbackAck {
                    status: Some(DeploymentStatus::RolledBack),
                    ..RollbackAck::rejected("deployment already rolled back")
                }
            }
            status => {
                return RollbackAck {
                    status: Some(status),
                    ..RollbackAck::rejected(format!("cannot roll back a {} deployment", status))
                }
            }
        }

        info!("Manual rollback of {} requested: {}", deployment_id, reason);
        match self.state.engine.trigger_rollback(deployment_id, &[], true).await {
            Ok(restored) => {
                let status = self
                    .state
                    .records
                    .get(deployment_id)
                    .await
                    .map(|d| d.status)
                    .ok();
                let message = if restored {
                    format!("rolled back: {}", reason)
                } else {
                    format!("rollback incomplete, manual intervention required: {}", reason)
                };
                RollbackAck {
                    accepted: true,
                    message,
                    status,
                }
            }
            Err(e) => {
                warn!("Manual rollback of {} refused: {}", deployment_id, e);
                RollbackAck::rejected(e.to_string())
            }
        }
    }

    /// One sampling pass and verdict, independent of any running monitor
    pub async fn evaluate_health(&self, deployment_id: &str) -> Result<HealthReport, RemediationError> {
        let deployment = self.state.records.get(deployment_id).await?;
        let targets = deployment.touched_targets();

        let mut metrics = Vec::new();
        let mut anomalies = Vec::new();
        for target_id in &targets {
            match self.state.collector.collect_system(target_id).await {
                Ok(current) => {
                    let current: Vec<Metric> = current
                        .into_iter()
                        .map(|m| m.with_label(LABEL_DEPLOYMENT, deployment_id))
                        .collect();
                    let baseline = deployment.baseline.get(target_id).map(Vec::as_slice);
                    anomalies.extend(self.state.detector.detect(&current, baseline));
                    metrics.extend(current);
                }
                Err(e) => warn!("Health sample of {} failed: {}", target_id, e),
            }
        }
        let current = self.state.collector.collect_deployment(deployment_id).await?;
        anomalies.extend(self.state.detector.detect(&current, None));
        metrics.extend(current);

        let decision = self.state.engine.evaluate(deployment_id, &anomalies);
        Ok(HealthReport {
            deployment_id: deployment_id.to_string(),
            health_score: health_score(&anomalies),
            anomalies,
            metrics,
            decision,
            evaluated_at: Utc::now(),
        })
    }

    /// Create a fresh pending deployment from a failed or rolled-back one
    pub async fn retry_deployment(&self, deployment_id: &str) -> Result<DeploymentSnapshot, RemediationError> {
        let parent = self.state.records.get(deployment_id).await?;
        if !matches!(
            parent.status,
            DeploymentStatus::Failed | DeploymentStatus::RolledBack
        ) {
            return Err(RemediationError::InvalidTransition(format!(
                "only failed or rolled back deployments can be retried, {} is {}",
                deployment_id, parent.status
            )));
        }
        let max_retries = self.state.fsm_settings.max_retries;
        if parent.retry_count >= max_retries {
            return Err(RemediationError::ValidationError(format!(
                "deployment {} reached the retry limit ({})",
                deployment_id, max_retries
            )));
        }

        let mut retry = Deployment::new(
            parent.patch_id.clone(),
            parent.target_ids.clone(),
            parent.strategy,
            parent.params.clone(),
        );
        retry.parent_deployment_id = Some(parent.id.clone());
        retry.retry_count = parent.retry_count + 1;
        self.state.records.create(&retry).await?;

        info!(
            "Deployment {} retried as {} (attempt {}/{})",
            parent.id, retry.id, retry.retry_count, max_retries
        );
        Ok(retry.snapshot())
    }

    /// Signal a running execution; false when nothing is running
    pub fn cancel(&self, deployment_id: &str) -> bool {
        let found = self.state.inflight.cancel(deployment_id);
        if found {
            info!("Cancellation requested for {}", deployment_id);
        }
        found
    }
}
