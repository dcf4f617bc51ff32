//! Deployment module

pub mod cancel;
pub mod executor;
pub mod fsm;
pub mod guard;
pub mod monitor;
pub mod strategy;
pub mod worker;

pub use cancel::CancelToken;
pub use executor::{DeploymentExecutor, DeploymentOutcome};
pub use fsm::{DeploymentEvent, DeploymentStatus};
