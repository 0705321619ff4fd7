//! Configuration management for clipsort.
//!
//! Configuration is loaded from the platform config directory with sensible
//! defaults. A running job never reads `Config` directly: it receives an
//! immutable [`JobConfig`] snapshot taken at start time.

mod snapshot;
mod types;
mod validate;

pub use snapshot::{JobConfig, MAX_CONCURRENCY};
pub use types::*;

use crate::embedding::EngineOptions;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for clipsort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Processing settings
    pub processing: ProcessingConfig,

    /// Engine choice and value judgment
    pub analysis: AnalysisConfig,

    /// CLIP model settings
    pub embedding: EmbeddingConfig,

    /// Execution provider toggles
    pub accel: AccelConfig,

    /// Remote vision model settings
    pub remote: RemoteConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.clipsort.clipsort/config.toml
    /// - Linux: ~/.config/clipsort/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\clipsort\config\config.toml
    ///
    /// Falls back to ~/.clipsort/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "clipsort", "clipsort")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".clipsort").join("config.toml")
            })
    }

    /// Get the resolved model directory path (with ~ expansion).
    pub fn model_dir(&self) -> PathBuf {
        let path_str = self.general.model_dir.to_string_lossy();
        let expanded = shellexpand::tilde(&path_str);
        PathBuf::from(expanded.into_owned())
    }

    /// Session-building options for a pool of `pool_size` sessions.
    pub fn engine_options(&self, pool_size: usize) -> EngineOptions {
        let pool_size = pool_size.max(1);
        let intra_threads = if self.embedding.intra_threads > 0 {
            self.embedding.intra_threads
        } else {
            available_cores().div_ceil(pool_size).max(1)
        };
        EngineOptions {
            model_dir: self.model_dir(),
            model_file: self.embedding.model_file.clone(),
            image_size: self.embedding.image_size,
            pool_size,
            intra_threads,
            accel: self.accel.clone(),
        }
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
