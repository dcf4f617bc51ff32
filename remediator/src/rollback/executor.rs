//! Rollback execution

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::errors::RemediationError;
use crate::models::asset::{Asset, PackageManager};
use crate::models::backup::{BackupManifest, BackupRecord};
use crate::models::patch::Patch;
use crate::models::rollback::{RollbackResult, RollbackStrategy};
use crate::remote::{connect_with_retry, Connection, ExecOptions, RemoteExecutor, RetryPolicy};
use crate::rollback::packages::{
    extract_install_packages, manager_in_content, parse_package_list, PROBE_SCRIPT,
};
use crate::rollback::strategy::select_strategy;
use crate::rollback::undo::synthesize_undo;
use crate::utils::{encode_script, shell_quote};

/// Restores infrastructure-level snapshots (hypervisor, cloud provider)
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Restore `snapshot_id` onto `asset`, returning a status message
    async fn restore(&self, asset: &Asset, snapshot_id: &str) -> Result<String, RemediationError>;
}

/// What the executor knows about the run being reverted
#[derive(Debug, Clone, Copy)]
pub struct RollbackContext<'a> {
    pub deployment_id: &'a str,
    pub backup: Option<&'a BackupRecord>,
}

#[derive(Debug, Clone)]
pub struct RollbackOptions {
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Partial result filled in by each strategy
struct StrategyOutcome {
    success: bool,
    message: String,
    stdout: String,
    stderr: String,
    flagged: Vec<String>,
}

impl StrategyOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            flagged: Vec::new(),
        }
    }
}

pub struct RollbackExecutor {
    remote: Arc<dyn RemoteExecutor>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    options: RollbackOptions,
}

impl RollbackExecutor {
    pub fn new(remote: Arc<dyn RemoteExecutor>, options: RollbackOptions) -> Self {
        Self {
            remote,
            snapshots: None,
            options,
        }
    }

    pub fn with_snapshots(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(provider);
        self
    }

    /// Revert `patch` on `asset` with the strategy the patch calls for
    pub async fn rollback(
        &self,
        asset: &Asset,
        patch: &Patch,
        ctx: RollbackContext<'_>,
    ) -> RollbackResult {
        let strategy = select_strategy(patch);
        let started = Instant::now();
        info!(
            "Rolling back {} on {} using {:?}",
            patch.id, asset.id, strategy
        );

        let outcome = match strategy {
            RollbackStrategy::Snapshot => self.restore_snapshot(asset).await,
            _ => self.run_connected(asset, patch, strategy, ctx).await,
        };

        if outcome.success {
            info!("Rollback of {} on {} succeeded", ctx.deployment_id, asset.id);
        } else {
            error!(
                "Rollback of {} on {} failed: {}",
                ctx.deployment_id, asset.id, outcome.message
            );
        }
        RollbackResult {
            target_id: asset.id.clone(),
            success: outcome.success,
            strategy,
            message: outcome.message,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            flagged: outcome.flagged,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Open a connection, run the strategy, and always disconnect
    async fn run_connected(
        &self,
        asset: &Asset,
        patch: &Patch,
        strategy: RollbackStrategy,
        ctx: RollbackContext<'_>,
    ) -> StrategyOutcome {
        let conn = match connect_with_retry(self.remote.as_ref(), asset, &self.options.retry, None).await {
            Ok(conn) => conn,
            Err(e) => return StrategyOutcome::failed(format!("cannot reach target: {}", e)),
        };

        let result = match strategy {
            RollbackStrategy::UndoScript => self.undo_script(&conn, patch).await,
            RollbackStrategy::PackageDowngrade => self.package_downgrade(&conn, asset, patch, ctx).await,
            RollbackStrategy::FileRestore => self.file_restore(&conn, ctx).await,
            RollbackStrategy::Snapshot => Ok(StrategyOutcome::failed("snapshot restore needs no connection")),
        };
        self.remote.disconnect(conn).await;

        result.unwrap_or_else(|e| StrategyOutcome::failed(e.to_string()))
    }

    async fn run(&self, conn: &Connection, command: &str) -> Result<StrategyOutcome, RemediationError> {
        let output = self
            .remote
            .execute(conn, command, ExecOptions::privileged(self.options.command_timeout))
            .await?;
        let message = if output.success {
            "rollback commands completed".to_string()
        } else {
            format!("rollback commands exited with {}", output.exit_code)
        };
        Ok(StrategyOutcome {
            success: output.success,
            message,
            stdout: output.stdout,
            stderr: output.stderr,
            flagged: Vec::new(),
        })
    }

    /// Read a file from the target, `None` when it is absent
    async fn read_remote(&self, conn: &Connection, path: &str) -> Result<Option<String>, RemediationError> {
        let output = self
            .remote
            .execute(
                conn,
                &format!("cat {}", shell_quote(path)),
                ExecOptions::privileged(self.options.command_timeout),
            )
            .await?;
        Ok(output.success.then_some(output.stdout))
    }

    async fn read_manifest(
        &self,
        conn: &Connection,
        backup: &BackupRecord,
    ) -> Result<Option<BackupManifest>, RemediationError> {
        if !backup.success {
            return Ok(None);
        }
        match self.read_remote(conn, &backup.manifest_path()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn undo_script(&self, conn: &Connection, patch: &Patch) -> Result<StrategyOutcome, RemediationError> {
        if let Some(script) = patch.undo() {
            return self.run(conn, &encode_script(script)).await;
        }

        let derived = synthesize_undo(&patch.content);
        let mut outcome = if derived.commands > 0 {
            self.run(conn, &encode_script(&derived.script)).await?
        } else {
            StrategyOutcome {
                success: true,
                message: String::new(),
                stdout: String::new(),
                stderr: String::new(),
                flagged: Vec::new(),
            }
        };
        if !derived.reversible {
            warn!(
                "Derived undo for {} left {} unreversible lines",
                patch.id,
                derived.flagged.len()
            );
            outcome.success = false;
            outcome.message = format!(
                "{} line(s) could not be reversed automatically; manual intervention required",
                derived.flagged.len()
            );
        } else if derived.commands == 0 {
            outcome.message = "derived undo script had nothing to reverse".to_string();
        }
        outcome.flagged = derived.flagged;
        Ok(outcome)
    }

    async fn detect_manager(&self, conn: &Connection, asset: &Asset, patch: &Patch) -> Result<Option<PackageManager>, RemediationError> {
        if let Some(pm) = asset.hinted_package_manager() {
            return Ok(Some(pm));
        }
        let output = self
            .remote
            .execute(conn, PROBE_SCRIPT, ExecOptions::unprivileged(self.options.command_timeout))
            .await?;
        Ok(PackageManager::parse_probe(&output.stdout).or_else(|| manager_in_content(&patch.content)))
    }

    async fn package_downgrade(
        &self,
        conn: &Connection,
        asset: &Asset,
        patch: &Patch,
        ctx: RollbackContext<'_>,
    ) -> Result<StrategyOutcome, RemediationError> {
        let Some(manager) = self.detect_manager(conn, asset, patch).await? else {
            return Ok(StrategyOutcome::failed("no supported package manager on target"));
        };

        let mut packages = extract_install_packages(&patch.content);
        if let Some(name) = patch.package_name() {
            if !packages.iter().any(|p| p == name) {
                packages.push(name.to_string());
            }
        }
        if packages.is_empty() {
            return Ok(StrategyOutcome::failed("patch references no installable packages"));
        }

        let prior: Option<HashMap<String, String>> = match ctx.backup {
            Some(backup) => match self.read_manifest(conn, backup).await? {
                Some(BackupManifest {
                    package_list: Some(path),
                    ..
                }) => self.read_remote(conn, &path).await?.map(|raw| parse_package_list(&raw)),
                _ => None,
            },
            None => None,
        };

        let mut commands = vec!["set -e".to_string()];
        let mut flagged = Vec::new();
        for package in &packages {
            let command = match &prior {
                Some(list) => match list.get(package) {
                    Some(version) => manager.pin_command(package, version),
                    None => manager.remove_command(package),
                },
                None => match patch.previous_version() {
                    Some(version) if packages.len() == 1 || patch.package_name() == Some(package.as_str()) => {
                        manager.pin_command(package, version)
                    }
                    _ => {
                        flagged.push(format!("{}: no prior version known, reinstalled", package));
                        manager.reinstall_command(package)
                    }
                },
            };
            commands.push(command);
        }

        let mut outcome = self.run(conn, &encode_script(&commands.join("\n"))).await?;
        if outcome.success {
            outcome.message = format!("restored {} package(s) with {:?}", packages.len(), manager);
        }
        outcome.flagged = flagged;
        Ok(outcome)
    }

    async fn file_restore(&self, conn: &Connection, ctx: RollbackContext<'_>) -> Result<StrategyOutcome, RemediationError> {
        let Some(backup) = ctx.backup else {
            return Ok(StrategyOutcome::failed(format!(
                "no backup recorded for deployment {}",
                ctx.deployment_id
            )));
        };
        if !backup.success {
            return Ok(StrategyOutcome::failed(format!(
                "target is unbacked: {}",
                backup.error.as_deref().unwrap_or("backup failed")
            )));
        }

        let Some(manifest) = self.read_manifest(conn, backup).await? else {
            return Ok(StrategyOutcome::failed(format!(
                "backup manifest missing at {}",
                backup.manifest_path()
            )));
        };
        let Some(archive) = manifest.archive.filter(|_| !manifest.items.is_empty()) else {
            return Ok(StrategyOutcome::failed("backup holds no file archive"));
        };

        let mut outcome = self
            .run(conn, &format!("tar -xzpf {} -C /", shell_quote(&archive)))
            .await?;
        if outcome.success {
            outcome.message = format!("restored {} path(s) from {}", manifest.items.len(), backup.backup_id);
        }
        Ok(outcome)
    }

    async fn restore_snapshot(&self, asset: &Asset) -> StrategyOutcome {
        let (Some(provider), Some(snapshot_id)) = (&self.snapshots, asset.snapshot_id.as_deref()) else {
            return StrategyOutcome::failed(format!(
                "snapshot rollback not implemented for asset type {:?}",
                asset.kind
            ));
        };
        match provider.restore(asset, snapshot_id).await {
            Ok(message) => StrategyOutcome {
                success: true,
                message,
                stdout: String::new(),
                stderr: String::new(),
                flagged: Vec::new(),
            },
            Err(e) => StrategyOutcome::failed(format!("snapshot {} restore failed: {}", snapshot_id, e)),
        }
    }
}
