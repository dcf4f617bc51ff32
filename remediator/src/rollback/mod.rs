//! Rollback: strategy selection, undo derivation, execution and decisions

pub mod decision;
pub mod executor;
pub mod packages;
pub mod strategy;
pub mod undo;

pub use decision::{DecisionConfig, DecisionPolicy, RollbackDecisionEngine};
pub use executor::{RollbackContext, RollbackExecutor, RollbackOptions, SnapshotProvider};
pub use strategy::select_strategy;
pub use undo::{synthesize_undo, UndoScript};
