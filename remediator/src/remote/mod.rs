//! Remote execution boundary
//!
//! The engine never speaks a remote protocol itself. Every command goes
//! through a [`RemoteExecutor`], which opens a fresh [`Connection`] per
//! operation. Callers disconnect on every exit path and never share a
//! connection between tasks.

pub mod container;
pub mod local;
pub mod process;
pub mod router;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::deploy::cancel::CancelToken;
use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// An open handle to one asset
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub asset: Asset,
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    pub fn open(asset: &Asset) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            asset: asset.clone(),
            opened_at: Utc::now(),
        }
    }
}

/// Per-command execution options
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Run with root privileges
    pub privileged: bool,
    pub timeout: Duration,
}

impl ExecOptions {
    pub fn privileged(timeout: Duration) -> Self {
        Self {
            privileged: true,
            timeout,
        }
    }

    pub fn unprivileged(timeout: Duration) -> Self {
        Self {
            privileged: false,
            timeout,
        }
    }
}

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Command runner for one class of asset
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Open a connection; fails with `ConnectionError` when unreachable
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError>;

    /// Run `command`; a non-zero exit code is an `Ok` output, not an error
    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError>;

    /// Release the connection; safe to call on an already-closed handle
    async fn disconnect(&self, conn: Connection);
}

/// Bounded retry for connection attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: CooldownOptions::default(),
        }
    }
}

/// Connect with exponential backoff between attempts.
///
/// Only connection errors are retried; the wait between attempts ends early
/// with `Cancelled` when `cancel` fires.
pub async fn connect_with_retry(
    remote: &dyn RemoteExecutor,
    asset: &Asset,
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
) -> Result<Connection, RemediationError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match remote.connect(asset).await {
            Ok(conn) => {
                debug!("Connected to {} ({})", asset.id, conn.id);
                return Ok(conn);
            }
            Err(e) if e.is_connection() && attempt + 1 < attempts => {
                let delay = calc_exp_backoff(&policy.backoff, attempt);
                warn!(
                    "Connection to {} failed (attempt {}/{}), retrying in {:?}: {}",
                    asset.id,
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                let slept = match cancel {
                    Some(token) => token.sleep(delay).await,
                    None => {
                        tokio::time::sleep(delay).await;
                        true
                    }
                };
                if !slept {
                    return Err(RemediationError::Cancelled(format!(
                        "connect to {} cancelled",
                        asset.id
                    )));
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
