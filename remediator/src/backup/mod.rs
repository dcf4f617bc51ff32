//! Pre-change backups
//!
//! The patch content decides what gets captured. Backups never raise: an
//! unreachable target or a failing command yields a record with
//! `success = false` and the caller decides whether to proceed unbacked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::deploy::cancel::CancelToken;
use crate::errors::RemediationError;
use crate::models::asset::{Asset, PackageManager};
use crate::models::backup::{BackupManifest, BackupRecord, BackupType};
use crate::models::patch::Patch;
use crate::remote::{connect_with_retry, Connection, ExecOptions, RemoteExecutor, RetryPolicy};
use crate::rollback::packages::has_package_verb;
use crate::utils::{encode_file_write, encode_script, generate_uuid, sha256_hash, shell_quote};

/// Roots whose paths mark a configuration change
const CONFIG_ROOTS: &[&str] = &["/etc/", "/usr/", "/opt/", "/var/"];

/// Pseudo filesystems never worth archiving
const SKIPPED_ROOTS: &[&str] = &["/dev/", "/proc/", "/sys/", "/run/", "/tmp/"];

/// Tokens that mark a change to service, kernel or boot state
const SYSTEM_TOKENS: &[&str] = &[
    "systemctl", "sysctl", "modprobe", "grub", "/boot", "kernel", "initramfs", "reboot",
];

const ARCHIVE_NAME: &str = "files.tar.gz";
const PACKAGE_LIST_NAME: &str = "packages.list";
const SERVICE_LIST_NAME: &str = "services.list";

/// Classify patch content; precedence is packages, configuration,
/// system state, then plain files
pub fn classify_backup_type(content: &str) -> BackupType {
    if has_package_verb(content) {
        return BackupType::Packages;
    }
    if !extract_paths(content).is_empty() {
        return BackupType::Configuration;
    }
    let lowered = content.to_lowercase();
    if SYSTEM_TOKENS.iter().any(|t| lowered.contains(t)) {
        return BackupType::SystemState;
    }
    BackupType::Files
}

fn path_tokens(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(|c: char| c.is_whitespace() || matches!(c, '\'' | '"' | ';' | '(' | ')' | '`' | '=' | '>' | '<' | '|' | ','))
        .map(|t| t.trim_end_matches(['.', ':', '&']))
        .filter(|t| t.starts_with('/') && t.len() > 1 && !t.contains(['*', '$', '?']))
}

fn push_unique(paths: &mut Vec<String>, path: &str) {
    let path = path.trim_end_matches('/');
    if !path.is_empty() && !paths.iter().any(|p| p == path) {
        paths.push(path.to_string());
    }
}

/// Paths under the configuration roots referenced by `content`, in order
pub fn extract_paths(content: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for token in path_tokens(content) {
        if CONFIG_ROOTS.iter().any(|root| token.starts_with(root)) {
            push_unique(&mut paths, token);
        }
    }
    paths
}

/// Every absolute path referenced by `content`, minus pseudo filesystems
fn extract_all_paths(content: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for token in path_tokens(content) {
        if !SKIPPED_ROOTS.iter().any(|root| token.starts_with(root)) {
            push_unique(&mut paths, token);
        }
    }
    paths
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub enabled: bool,
    /// Backup root on each target
    pub root: String,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            root: "/var/backups/remediator".to_string(),
            command_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Values printed by the backup script
#[derive(Debug, Default, PartialEq, Eq)]
struct BackupMarkers {
    size_bytes: u64,
    item_count: u64,
    items: Vec<String>,
}

fn parse_markers(stdout: &str) -> BackupMarkers {
    let mut markers = BackupMarkers::default();
    for line in stdout.lines() {
        if let Some(v) = line.strip_prefix("size=") {
            markers.size_bytes = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("items=") {
            markers.item_count = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("item=") {
            markers.items.push(format!("/{}", v.trim()));
        }
    }
    markers
}

/// Shell fallback chain dumping installed packages when the manager is unknown
const ANY_PACKAGE_LIST: &str = "if command -v dpkg-query >/dev/null 2>&1; then dpkg-query -W -f='${Package}\\t${Version}\\n'; \
elif command -v rpm >/dev/null 2>&1; then rpm -qa --qf '%{NAME}\\t%{VERSION}-%{RELEASE}\\n'; \
elif command -v apk >/dev/null 2>&1; then apk info -v 2>/dev/null | sed -E 's/^(.+)-([^-]+-r[0-9]+)$/\\1\\t\\2/'; fi";

/// Build the backup script for one target
fn backup_script(
    storage_path: &str,
    backup_type: BackupType,
    paths: &[String],
    manager: Option<PackageManager>,
) -> String {
    let mut script = vec![
        "set -e".to_string(),
        format!("dir={}", shell_quote(storage_path)),
        "mkdir -p \"$dir\"".to_string(),
        "items=0".to_string(),
    ];

    if backup_type == BackupType::Packages {
        let list = manager
            .map(|pm| pm.list_installed_command())
            .unwrap_or(ANY_PACKAGE_LIST);
        script.push(format!("{{ {}; }} > \"$dir/{}\"", list, PACKAGE_LIST_NAME));
        script.push(format!(
            "items=$((items + $(wc -l < \"$dir/{}\")))",
            PACKAGE_LIST_NAME
        ));
    }
    if backup_type == BackupType::SystemState {
        script.push(format!(
            "systemctl list-unit-files --no-pager --no-legend > \"$dir/{}\" 2>/dev/null || true",
            SERVICE_LIST_NAME
        ));
        script.push("uname -r > \"$dir/kernel.release\"".to_string());
        script.push("sysctl -a > \"$dir/sysctl.conf\" 2>/dev/null || true".to_string());
    }

    if !paths.is_empty() {
        let relative: Vec<String> = paths
            .iter()
            .map(|p| shell_quote(p.trim_start_matches('/')))
            .collect();
        script.push("set --".to_string());
        script.push(format!(
            "for p in {}; do if [ -e \"/$p\" ]; then set -- \"$@\" \"$p\"; echo \"item=$p\"; fi; done",
            relative.join(" ")
        ));
        script.push(format!(
            "if [ $# -gt 0 ]; then tar -czpf \"$dir/{}\" -C / \"$@\"; fi",
            ARCHIVE_NAME
        ));
        script.push("items=$((items + $#))".to_string());
    }

    script.push("echo \"size=$(( $(du -sk \"$dir\" | cut -f1) * 1024 ))\"".to_string());
    script.push("echo \"items=$items\"".to_string());
    script.join("\n")
}

pub struct BackupManager {
    remote: Arc<dyn RemoteExecutor>,
    options: BackupOptions,
}

impl BackupManager {
    pub fn new(remote: Arc<dyn RemoteExecutor>, options: BackupOptions) -> Self {
        Self { remote, options }
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Snapshot whatever `patch` is about to change on `asset`
    pub async fn create_backup(
        &self,
        asset: &Asset,
        patch: &Patch,
        deployment_id: &str,
        cancel: Option<&CancelToken>,
    ) -> BackupRecord {
        let started = Instant::now();
        let backup_id = generate_uuid();
        let backup_type = classify_backup_type(&patch.content);
        let storage_path = format!(
            "{}/{}/{}/{}",
            self.options.root.trim_end_matches('/'),
            deployment_id,
            asset.id,
            backup_id
        );

        let mut record = BackupRecord {
            backup_id,
            deployment_id: deployment_id.to_string(),
            target_id: asset.id.clone(),
            backup_type,
            storage_path,
            size_bytes: 0,
            item_count: 0,
            success: false,
            duration_ms: 0,
            created_at: Utc::now(),
            error: None,
        };

        if !self.options.enabled {
            record.error = Some("backups disabled".to_string());
            return record;
        }

        let result = match connect_with_retry(self.remote.as_ref(), asset, &self.options.retry, cancel).await {
            Ok(conn) => {
                let result = self.run_backup(&conn, asset, patch, &record, cancel).await;
                self.remote.disconnect(conn).await;
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(markers) => {
                record.success = true;
                record.size_bytes = markers.size_bytes;
                record.item_count = markers.item_count;
                info!(
                    "Backup {} of {} ({:?}): {} items, {} bytes",
                    record.backup_id, asset.id, backup_type, record.item_count, record.size_bytes
                );
            }
            Err(e) => {
                warn!("Backup of {} for {} failed: {}", asset.id, deployment_id, e);
                record.error = Some(e.to_string());
            }
        }
        record.duration_ms = started.elapsed().as_millis() as u64;
        record
    }

    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<crate::remote::CommandOutput, RemediationError> {
        let options = ExecOptions::privileged(self.options.command_timeout);
        let run = self.remote.execute(conn, command, options);
        match cancel {
            Some(token) => tokio::select! {
                output = run => output,
                _ = token.cancelled() => Err(RemediationError::Cancelled("backup interrupted".to_string())),
            },
            None => run.await,
        }
    }

    async fn run_backup(
        &self,
        conn: &Connection,
        asset: &Asset,
        patch: &Patch,
        record: &BackupRecord,
        cancel: Option<&CancelToken>,
    ) -> Result<BackupMarkers, RemediationError> {
        let paths = match record.backup_type {
            BackupType::Files => extract_all_paths(&patch.content),
            _ => extract_paths(&patch.content),
        };
        let manager = asset.hinted_package_manager();
        let script = backup_script(&record.storage_path, record.backup_type, &paths, manager);

        let output = self.execute(conn, &encode_script(&script), cancel).await?;
        if !output.success {
            return Err(RemediationError::BackupError(format!(
                "backup script exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let markers = parse_markers(&output.stdout);

        let manifest = BackupManifest {
            backup_id: record.backup_id.clone(),
            deployment_id: record.deployment_id.clone(),
            target_id: record.target_id.clone(),
            backup_type: record.backup_type,
            created_at: record.created_at,
            items: markers.items.clone(),
            archive: (!markers.items.is_empty())
                .then(|| format!("{}/{}", record.storage_path, ARCHIVE_NAME)),
            package_list: (record.backup_type == BackupType::Packages)
                .then(|| format!("{}/{}", record.storage_path, PACKAGE_LIST_NAME)),
            service_list: (record.backup_type == BackupType::SystemState)
                .then(|| format!("{}/{}", record.storage_path, SERVICE_LIST_NAME)),
            patch_digest: sha256_hash(patch.content.as_bytes()),
        };
        let body = serde_json::to_string_pretty(&manifest)?;
        let output = self
            .execute(conn, &encode_file_write(&record.manifest_path(), &body), cancel)
            .await?;
        if !output.success {
            return Err(RemediationError::BackupError(format!(
                "failed to write manifest: {}",
                output.stderr.trim()
            )));
        }
        Ok(markers)
    }
}
