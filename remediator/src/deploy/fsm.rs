//! Finite State Machine for deployment runs

use serde::{Deserialize, Serialize};

/// FSM settings
#[derive(Debug, Clone)]
pub struct FsmSettings {
    /// How many times a failed or rolled-back deployment may be retried
    pub max_retries: u32,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, not started
    Pending,

    /// Validating patch, targets and parameters
    PreCheckRunning,

    PreCheckPassed,

    PreCheckFailed,

    /// Phases executing
    Deploying,

    Success,

    Failed,

    /// Reverting touched targets
    RollingBack,

    RolledBack,

    Cancelled,
}

impl DeploymentStatus {
    /// No further execution happens from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
        )
    }

    /// Numeric code exported as the `deployment_status_code` metric
    pub fn code(&self) -> u8 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::PreCheckRunning => 1,
            DeploymentStatus::PreCheckPassed => 2,
            DeploymentStatus::PreCheckFailed => 3,
            DeploymentStatus::Deploying => 4,
            DeploymentStatus::Success => 5,
            DeploymentStatus::Failed => 6,
            DeploymentStatus::RollingBack => 7,
            DeploymentStatus::RolledBack => 8,
            DeploymentStatus::Cancelled => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::PreCheckRunning => "pre_check_running",
            DeploymentStatus::PreCheckPassed => "pre_check_passed",
            DeploymentStatus::PreCheckFailed => "pre_check_failed",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    BeginPreCheck,

    PreCheckPassed,

    PreCheckFailed(String),

    StartDeploying,

    /// Every phase completed within policy
    Succeed,

    Fail(String),

    /// Rollback begins, with the reason code
    RollbackStarted(String),

    RollbackCompleted,

    RollbackFailed(String),

    Cancel,
}

/// Compute the next status for `event`, or describe why it is not allowed
pub fn transition(
    state: DeploymentStatus,
    event: &DeploymentEvent,
) -> Result<DeploymentStatus, String> {
    use DeploymentEvent as E;
    use DeploymentStatus as S;

    let next = match (state, event) {
        // From Pending
        (S::Pending, E::BeginPreCheck) => S::PreCheckRunning,

        // From PreCheckRunning
        (S::PreCheckRunning, E::PreCheckPassed) => S::PreCheckPassed,
        (S::PreCheckRunning, E::PreCheckFailed(_)) => S::PreCheckFailed,

        // From PreCheckPassed / PreCheckFailed
        (S::PreCheckPassed, E::StartDeploying) => S::Deploying,
        (S::PreCheckFailed, E::Fail(_)) => S::Failed,

        // From Deploying
        (S::Deploying, E::Succeed) => S::Success,
        (S::Deploying, E::Fail(_)) => S::Failed,

        // Automatic rollback mid-run, or manual rollback after the fact
        (S::Deploying | S::Success | S::Failed, E::RollbackStarted(_)) => S::RollingBack,

        // From RollingBack
        (S::RollingBack, E::RollbackCompleted) => S::RolledBack,
        (S::RollingBack, E::RollbackFailed(_)) => S::Failed,

        // Cancel from any non-terminal state except an in-progress rollback
        (
            S::Pending | S::PreCheckRunning | S::PreCheckPassed | S::PreCheckFailed | S::Deploying,
            E::Cancel,
        ) => S::Cancelled,

        // Invalid transitions
        (state, event) => {
            return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
        }
    };

    Ok(next)
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Pending,
            error: None,
        }
    }

    /// Pick up a machine at a persisted state
    pub fn resume(state: DeploymentStatus, error: Option<String>) -> Self {
        Self { state, error }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: &DeploymentEvent) -> Result<(), String> {
        let next = transition(self.state, event)?;
        match event {
            DeploymentEvent::PreCheckFailed(err)
            | DeploymentEvent::Fail(err)
            | DeploymentEvent::RollbackFailed(err) => self.error = Some(err.clone()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
