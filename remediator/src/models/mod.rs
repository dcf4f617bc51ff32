//! Domain models

pub mod anomaly;
pub mod asset;
pub mod backup;
pub mod deployment;
pub mod metric;
pub mod patch;
pub mod rollback;
