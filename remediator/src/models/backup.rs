//! Backup records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a backup captures, chosen from the patch content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Files,
    Packages,
    Configuration,
    SystemState,
}

/// Result of one backup on one target. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub deployment_id: String,
    pub target_id: String,
    pub backup_type: BackupType,
    /// Directory on the target holding the backup
    pub storage_path: String,
    pub size_bytes: u64,
    pub item_count: u64,
    pub success: bool,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    /// Failure reason when `success` is false
    #[serde(default)]
    pub error: Option<String>,
}

impl BackupRecord {
    /// Path of the metadata manifest written next to the backup
    pub fn manifest_path(&self) -> String {
        format!("{}/manifest.json", self.storage_path)
    }
}

/// Manifest written on the target alongside the backup data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub deployment_id: String,
    pub target_id: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    /// Original paths captured in the archive
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub package_list: Option<String>,
    #[serde(default)]
    pub service_list: Option<String>,
    /// sha256 of the patch content the backup guards
    pub patch_digest: String,
}
