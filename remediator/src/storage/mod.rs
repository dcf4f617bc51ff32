//! Persistence interfaces and local storage

pub mod audit;
pub mod deployments;
pub mod inventory;
pub mod layout;
pub mod settings;
