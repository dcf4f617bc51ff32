//! Per-target patch application and the phase worker pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backup::BackupManager;
use crate::deploy::cancel::CancelToken;
use crate::errors::RemediationError;
use crate::models::deployment::{TargetOutcome, TargetResult};
use crate::models::patch::Patch;
use crate::remote::{connect_with_retry, ExecOptions, RemoteExecutor, RetryPolicy};
use crate::storage::audit::{AuditEntry, AuditKind};
use crate::storage::deployments::DeploymentRecords;
use crate::storage::inventory::AssetInventory;
use crate::utils::encode_script;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Applies a patch to one target: backup, then execute
pub struct TargetWorker {
    remote: Arc<dyn RemoteExecutor>,
    inventory: Arc<dyn AssetInventory>,
    backups: Arc<BackupManager>,
    records: Arc<DeploymentRecords>,
    options: WorkerOptions,
}

impl TargetWorker {
    pub fn new(
        remote: Arc<dyn RemoteExecutor>,
        inventory: Arc<dyn AssetInventory>,
        backups: Arc<BackupManager>,
        records: Arc<DeploymentRecords>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            remote,
            inventory,
            backups,
            records,
            options,
        }
    }

    /// Back up `target_id`, then run the patch on it.
    ///
    /// A failed backup degrades the target to unbacked; it does not stop the
    /// patch. Cancellation before execution leaves the target untouched.
    pub async fn apply_to_target(
        &self,
        deployment_id: &str,
        target_id: &str,
        patch: &Patch,
        cancel: &CancelToken,
    ) -> TargetResult {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return TargetResult::not_attempted(target_id, "cancelled before start");
        }

        let asset = match self.inventory.get_asset(target_id).await {
            Ok(asset) => asset,
            Err(e) => {
                return failed_result(
                    target_id,
                    TargetOutcome::ConnectionFailed,
                    format!("asset lookup failed: {}", e),
                    started,
                )
            }
        };

        let backup = self.backups.create_backup(&asset, patch, deployment_id, Some(cancel)).await;
        let backup_id = backup.backup_id.clone();
        let unbacked = !backup.success;
        self.record_backup(deployment_id, backup).await;

        if cancel.is_cancelled() {
            return TargetResult::not_attempted(target_id, "cancelled after backup");
        }
        if unbacked {
            warn!("Proceeding unbacked on {} for {}", target_id, deployment_id);
        }

        let conn = match connect_with_retry(self.remote.as_ref(), &asset, &self.options.retry, Some(cancel)).await {
            Ok(conn) => conn,
            Err(RemediationError::Cancelled(_)) => {
                return TargetResult::not_attempted(target_id, "cancelled while connecting")
            }
            Err(e) => {
                let mut result = failed_result(
                    target_id,
                    TargetOutcome::ConnectionFailed,
                    format!("unreachable: {}", e),
                    started,
                );
                result.backup_id = Some(backup_id);
                result.unbacked = unbacked;
                return result;
            }
        };

        let options = ExecOptions::privileged(self.options.command_timeout);
        let script = encode_script(&patch.content);
        let run = self.remote.execute(&conn, &script, options);
        let output = tokio::select! {
            output = run => output,
            _ = cancel.cancelled() => Err(RemediationError::Cancelled("interrupted during execution".to_string())),
        };
        self.remote.disconnect(conn).await;

        let mut result = match output {
            Ok(output) => {
                let outcome = if output.success {
                    TargetOutcome::Succeeded
                } else {
                    TargetOutcome::ExecutionFailed
                };
                let message = if output.success {
                    "patch applied".to_string()
                } else {
                    format!("patch exited with {}", output.exit_code)
                };
                TargetResult {
                    target_id: target_id.to_string(),
                    outcome,
                    exit_code: Some(output.exit_code),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    message,
                    backup_id: None,
                    unbacked,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            // The command may have partially run, so the target counts as touched
            Err(e) => failed_result(target_id, TargetOutcome::ExecutionFailed, e.to_string(), started),
        };
        result.backup_id = Some(backup_id);
        result.unbacked = unbacked;

        match result.outcome {
            TargetOutcome::Succeeded => info!("Patch {} applied on {}", patch.id, target_id),
            _ => error!("Patch {} failed on {}: {}", patch.id, target_id, result.message),
        }
        result
    }

    async fn record_backup(&self, deployment_id: &str, backup: crate::models::backup::BackupRecord) {
        let detail = json!({
            "target_id": backup.target_id,
            "backup_id": backup.backup_id,
            "backup_type": backup.backup_type,
            "storage_path": backup.storage_path,
            "size_bytes": backup.size_bytes,
            "item_count": backup.item_count,
            "success": backup.success,
            "duration_ms": backup.duration_ms,
            "error": backup.error,
        });
        let stored = self
            .records
            .update(deployment_id, move |d| {
                d.backups.insert(backup.target_id.clone(), backup);
                Ok(())
            })
            .await;
        if let Err(e) = stored {
            warn!("Failed to record backup for {}: {}", deployment_id, e);
        }
        self.records
            .audit(AuditEntry::new(deployment_id, AuditKind::Backup, detail))
            .await;
    }
}

fn failed_result(target_id: &str, outcome: TargetOutcome, message: String, started: Instant) -> TargetResult {
    TargetResult {
        target_id: target_id.to_string(),
        outcome,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        message,
        backup_id: None,
        unbacked: true,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Run one phase: fan out over a bounded pool, fan results back in.
///
/// Results come back in `targets` order. A task that dies without reporting
/// is recorded as an execution failure.
pub async fn run_phase(
    worker: Arc<TargetWorker>,
    deployment_id: &str,
    patch: Arc<Patch>,
    targets: &[String],
    concurrency: usize,
    cancel: &CancelToken,
) -> Vec<TargetResult> {
    if targets.is_empty() {
        return Vec::new();
    }
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<TargetResult>(targets.len());

    for target_id in targets {
        let worker = Arc::clone(&worker);
        let semaphore = Arc::clone(&semaphore);
        let patch = Arc::clone(&patch);
        let cancel = cancel.clone();
        let tx = tx.clone();
        let deployment_id = deployment_id.to_string();
        let target_id = target_id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let result = worker
                .apply_to_target(&deployment_id, &target_id, &patch, &cancel)
                .await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut collected: HashMap<String, TargetResult> = HashMap::with_capacity(targets.len());
    while let Some(result) = rx.recv().await {
        debug!("Target {} reported {:?}", result.target_id, result.outcome);
        collected.insert(result.target_id.clone(), result);
    }

    targets
        .iter()
        .map(|target_id| {
            collected.remove(target_id).unwrap_or_else(|| TargetResult {
                target_id: target_id.clone(),
                outcome: TargetOutcome::ExecutionFailed,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                message: "worker task ended without a result".to_string(),
                backup_id: None,
                unbacked: true,
                duration_ms: 0,
            })
        })
        .collect()
}
