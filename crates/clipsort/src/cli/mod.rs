//! Command implementations.

pub mod accel;
pub mod analyze;
pub mod config;
pub mod models;

use std::path::PathBuf;

/// Expand `~` and environment variables in a path argument.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string()))
}
