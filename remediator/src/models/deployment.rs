//! Deployment models

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use crate::errors::RemediationError;
use crate::models::anomaly::Anomaly;
use crate::models::backup::BackupRecord;
use crate::models::metric::Metric;
use crate::models::rollback::{RollbackDecision, RollbackResult};

/// How targets are partitioned into phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    AllAtOnce,
    Rolling,
    Canary,
    BlueGreen,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::AllAtOnce => "all_at_once",
            Strategy::Rolling => "rolling",
            Strategy::Canary => "canary",
            Strategy::BlueGreen => "blue_green",
        };
        f.write_str(name)
    }
}

/// Strategy tuning knobs supplied with the deployment request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Rolling batch size (default 1)
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Cumulative canary rollout percentages, e.g. `[20, 50, 100]`
    #[serde(default)]
    pub canary_percentages: Vec<u8>,

    /// Monitoring wait after each phase; falls back to the configured window
    #[serde(default)]
    pub wait_secs: Option<u64>,

    /// Share of failed targets a phase tolerates before the run aborts
    #[serde(default)]
    pub max_failure_rate: f64,

    /// Worker pool size; defaults to the phase size
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Hosts currently serving traffic in a blue/green rollout
    #[serde(default)]
    pub blue_targets: Vec<String>,
}

/// Result of validating a deployment before anything runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCheckResult {
    pub passed: bool,
    pub errors: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// What happened to one target in one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOutcome {
    Succeeded,
    ExecutionFailed,
    ConnectionFailed,
    NotAttempted,
}

impl TargetOutcome {
    /// Whether the patch may have changed the host
    pub fn touched(&self) -> bool {
        matches!(self, TargetOutcome::Succeeded | TargetOutcome::ExecutionFailed)
    }

    pub fn failed(&self) -> bool {
        matches!(
            self,
            TargetOutcome::ExecutionFailed | TargetOutcome::ConnectionFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    pub outcome: TargetOutcome,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub message: String,
    #[serde(default)]
    pub backup_id: Option<String>,
    /// No usable backup exists for this target
    pub unbacked: bool,
    pub duration_ms: u64,
}

impl TargetResult {
    pub fn not_attempted(target_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            outcome: TargetOutcome::NotAttempted,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: message.into(),
            backup_id: None,
            unbacked: true,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub index: usize,
    pub label: String,
    #[serde(default)]
    pub percentage: Option<u8>,
    pub targets: Vec<TargetResult>,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn failure_rate(&self) -> f64 {
        let attempted = self
            .targets
            .iter()
            .filter(|t| t.outcome != TargetOutcome::NotAttempted)
            .count();
        if attempted == 0 {
            return 0.0;
        }
        let failed = self.targets.iter().filter(|t| t.outcome.failed()).count();
        failed as f64 / attempted as f64
    }
}

/// One request to roll a patch out to a set of targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub patch_id: String,
    pub target_ids: Vec<String>,
    pub strategy: Strategy,
    #[serde(default)]
    pub params: StrategyParams,
    pub status: DeploymentStatus,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub pre_check: Option<PreCheckResult>,

    #[serde(default)]
    pub canary_percentage: Option<u8>,
    #[serde(default)]
    pub canary_phase: Option<usize>,
    #[serde(default)]
    pub canary_wait_secs: Option<u64>,

    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub rollback_reason: Option<String>,
    #[serde(default)]
    pub rollback_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollback_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollback_results: Vec<RollbackResult>,
    #[serde(default)]
    pub last_decision: Option<RollbackDecision>,

    /// Backup per target, keyed by target ID
    #[serde(default)]
    pub backups: BTreeMap<String, BackupRecord>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_deployment_id: Option<String>,

    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(default)]
    pub baseline: BTreeMap<String, Vec<Metric>>,

    /// Green set validated and ready for traffic switch
    #[serde(default)]
    pub cutover_ready: bool,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Deployment {
    /// Create a pending deployment
    pub fn new(
        patch_id: impl Into<String>,
        target_ids: Vec<String>,
        strategy: Strategy,
        params: StrategyParams,
    ) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            patch_id: patch_id.into(),
            target_ids,
            strategy,
            params,
            status: DeploymentStatus::Pending,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            pre_check: None,
            canary_percentage: None,
            canary_phase: None,
            canary_wait_secs: None,
            rolled_back: false,
            rollback_reason: None,
            rollback_started_at: None,
            rollback_completed_at: None,
            rollback_results: Vec::new(),
            last_decision: None,
            backups: BTreeMap::new(),
            retry_count: 0,
            parent_deployment_id: None,
            phases: Vec::new(),
            baseline: BTreeMap::new(),
            cutover_ready: false,
            error: None,
            summary: None,
        }
    }

    /// Apply a state machine event and stamp the matching timestamps
    pub fn apply(&mut self, event: &DeploymentEvent) -> Result<DeploymentStatus, RemediationError> {
        let previous = self.status;
        let mut machine = DeploymentFsm::resume(previous, self.error.clone());
        machine
            .process(event)
            .map_err(RemediationError::InvalidTransition)?;
        let now = Utc::now();

        match event {
            DeploymentEvent::StartDeploying => self.started_at = Some(now),
            DeploymentEvent::RollbackStarted(reason) => {
                self.rollback_reason = Some(reason.clone());
                self.rollback_started_at = Some(now);
            }
            DeploymentEvent::RollbackCompleted => {
                self.rolled_back = true;
                self.rollback_completed_at = Some(now);
            }
            DeploymentEvent::RollbackFailed(_) => self.rollback_completed_at = Some(now),
            _ => {}
        }

        if machine.state().is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = machine.state();
        self.error = machine.error().map(String::from);
        Ok(previous)
    }

    /// Every per-target result across all phases
    pub fn target_results(&self) -> impl Iterator<Item = &TargetResult> {
        self.phases.iter().flat_map(|p| p.targets.iter())
    }

    /// Targets the patch may have changed, in execution order
    pub fn touched_targets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.target_results()
            .filter(|t| t.outcome.touched())
            .filter(|t| seen.insert(t.target_id.clone()))
            .map(|t| t.target_id.clone())
            .collect()
    }

    fn targets_with(&self, pred: impl Fn(&TargetOutcome) -> bool) -> Vec<String> {
        self.target_results()
            .filter(|t| pred(&t.outcome))
            .map(|t| t.target_id.clone())
            .collect()
    }

    pub fn succeeded_targets(&self) -> Vec<String> {
        self.targets_with(|o| *o == TargetOutcome::Succeeded)
    }

    pub fn failed_targets(&self) -> Vec<String> {
        self.targets_with(TargetOutcome::failed)
    }

    /// Requested targets that never ran the patch
    pub fn not_attempted_targets(&self) -> Vec<String> {
        let attempted: HashSet<&str> = self
            .target_results()
            .filter(|t| t.outcome != TargetOutcome::NotAttempted)
            .map(|t| t.target_id.as_str())
            .collect();
        self.target_ids
            .iter()
            .filter(|id| !attempted.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Targets whose latest rollback succeeded
    pub fn rolled_back_targets(&self) -> Vec<String> {
        self.rollback_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.target_id.clone())
            .collect()
    }

    /// Point-in-time view for callers outside the engine
    pub fn snapshot(&self) -> DeploymentSnapshot {
        DeploymentSnapshot {
            id: self.id.clone(),
            patch_id: self.patch_id.clone(),
            strategy: self.strategy,
            status: self.status,
            phases_completed: self.phases.len(),
            canary_percentage: self.canary_percentage,
            canary_phase: self.canary_phase,
            succeeded: self.succeeded_targets(),
            failed: self.failed_targets(),
            not_attempted: self.not_attempted_targets(),
            rolled_back_targets: self.rolled_back_targets(),
            rolled_back: self.rolled_back,
            rollback_reason: self.rollback_reason.clone(),
            retry_count: self.retry_count,
            cutover_ready: self.cutover_ready,
            started_at: self.started_at,
            completed_at: self.completed_at,
            summary: self.summary.clone(),
        }
    }
}

/// Status snapshot returned by `get_deployment_state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub id: String,
    pub patch_id: String,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    pub phases_completed: usize,
    pub canary_percentage: Option<u8>,
    pub canary_phase: Option<usize>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub not_attempted: Vec<String>,
    pub rolled_back_targets: Vec<String>,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
    pub retry_count: u32,
    pub cutover_ready: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}
