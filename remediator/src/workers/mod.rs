//! Background workers

pub mod dispatcher;
