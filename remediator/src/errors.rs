//! Error types for the remediation engine

use thiserror::Error;

/// Main error type for the remediation engine
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Command timed out: {0}")]
    Timeout(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Rollback error: {0}")]
    RollbackError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Deployment already running: {0}")]
    DeploymentBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RemediationError {
    fn from(err: anyhow::Error) -> Self {
        RemediationError::Internal(err.to_string())
    }
}

impl RemediationError {
    /// Whether the error comes from reaching the host rather than running on it
    pub fn is_connection(&self) -> bool {
        matches!(self, RemediationError::ConnectionError(_))
    }
}
