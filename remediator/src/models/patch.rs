//! Patch models

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::rollback::RollbackStrategy;

/// Declared kind of remediation content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchType {
    PackageUpdate,
    ConfigChange,
    Script,
    Manual,
}

/// Review status of a patch in the patch store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    #[default]
    Draft,
    Approved,
    Rejected,
}

/// Remediation content shipped to targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,

    pub patch_type: PatchType,

    /// Script body executed on each target
    pub content: String,

    /// Explicit undo instructions
    #[serde(default)]
    pub undo_script: Option<String>,

    /// Forces a rollback strategy regardless of content heuristics
    #[serde(default)]
    pub rollback_strategy: Option<RollbackStrategy>,

    /// Free-form hints: `service_name`, `package_name`, `previous_version`
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub status: PatchStatus,
}

impl Patch {
    /// Create an approved script patch
    pub fn script(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            patch_type: PatchType::Script,
            content: content.into(),
            undo_script: None,
            rollback_strategy: None,
            metadata: HashMap::new(),
            status: PatchStatus::Approved,
        }
    }

    /// Undo script when one was provided and is not blank
    pub fn undo(&self) -> Option<&str> {
        self.undo_script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
    }

    pub fn service_name(&self) -> Option<&str> {
        self.metadata.get("service_name").map(String::as_str)
    }

    pub fn package_name(&self) -> Option<&str> {
        self.metadata.get("package_name").map(String::as_str)
    }

    pub fn previous_version(&self) -> Option<&str> {
        self.metadata.get("previous_version").map(String::as_str)
    }
}
