//! Local file system helpers

pub mod dir;
pub mod file;
