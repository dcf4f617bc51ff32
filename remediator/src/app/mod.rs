//! Engine assembly and service facade

pub mod options;
pub mod run;
pub mod service;
pub mod state;
