//! Append-only audit trail

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RemediationError;
use crate::filesys::file::File;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Created,
    StateTransition,
    Backup,
    PhaseCompleted,
    AnomalyBatch,
    Decision,
    RollbackOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub deployment_id: String,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(deployment_id: &str, kind: AuditKind, detail: serde_json::Value) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            kind,
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// Persistence for audit entries; entries are never rewritten
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), RemediationError>;

    /// Entries for one deployment, oldest first
    async fn entries(&self, deployment_id: &str) -> Result<Vec<AuditEntry>, RemediationError>;
}

/// In-memory audit trail
#[derive(Default)]
pub struct MemoryAuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn append(&self, entry: AuditEntry) -> Result<(), RemediationError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
        Ok(())
    }

    async fn entries(&self, deployment_id: &str) -> Result<Vec<AuditEntry>, RemediationError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|e| e.deployment_id == deployment_id)
            .cloned()
            .collect())
    }
}

/// JSON-lines audit trail on local disk
pub struct FileAuditTrail {
    file: File,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileAuditTrail {
    pub fn new(file: File) -> Self {
        Self {
            file,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditTrail for FileAuditTrail {
    async fn append(&self, entry: AuditEntry) -> Result<(), RemediationError> {
        let line = serde_json::to_string(&entry)?;
        let _guard = self.write_lock.lock().await;
        self.file.append_line(&line).await
    }

    async fn entries(&self, deployment_id: &str) -> Result<Vec<AuditEntry>, RemediationError> {
        if !self.file.exists().await {
            return Ok(Vec::new());
        }
        let contents = self.file.read_string().await?;
        let mut out = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let entry: AuditEntry = serde_json::from_str(line)?;
            if entry.deployment_id == deployment_id {
                out.push(entry);
            }
        }
        Ok(out)
    }
}
