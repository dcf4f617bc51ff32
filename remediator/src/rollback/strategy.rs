//! Rollback strategy selection

use crate::models::patch::Patch;
use crate::models::rollback::RollbackStrategy;
use crate::rollback::packages::has_package_verb;

/// Pick the rollback strategy for `patch`.
///
/// Precedence: explicit strategy on the patch, then a non-blank undo script,
/// then package verbs in the content, then snapshot/backup tokens, then
/// file restore.
pub fn select_strategy(patch: &Patch) -> RollbackStrategy {
    if let Some(strategy) = patch.rollback_strategy {
        return strategy;
    }
    if patch.undo().is_some() {
        return RollbackStrategy::UndoScript;
    }
    if has_package_verb(&patch.content) {
        return RollbackStrategy::PackageDowngrade;
    }
    let lowered = patch.content.to_lowercase();
    if lowered.contains("snapshot") || lowered.contains("backup") {
        return RollbackStrategy::Snapshot;
    }
    RollbackStrategy::FileRestore
}
