//! Remediator Library
//!
//! Patch rollout engine: strategy-driven deployment to target hosts, baseline
//! aware anomaly detection, and backup-aware automatic rollback.

pub mod app;
pub mod backup;
pub mod deploy;
pub mod detect;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod remote;
pub mod rollback;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;
