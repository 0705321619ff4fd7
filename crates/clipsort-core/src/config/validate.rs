//! Configuration validation with range checks.

use crate::error::ConfigError;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    ///
    /// Concurrency is not checked here; it is clamped when a job snapshot is taken.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.supported_formats.is_empty() {
            return Err(ConfigError::ValidationError(
                "processing.supported_formats must not be empty".into(),
            ));
        }
        if self.embedding.model_file.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "embedding.model_file must not be empty".into(),
            ));
        }
        if self.embedding.image_size == 0 {
            return Err(ConfigError::ValidationError(
                "embedding.image_size must be > 0".into(),
            ));
        }
        if self.remote.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "remote.timeout_ms must be > 0".into(),
            ));
        }
        if !(1..=100).contains(&self.remote.jpeg_quality) {
            return Err(ConfigError::ValidationError(
                "remote.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        if self.remote.resize_enabled && self.remote.max_edge == 0 {
            return Err(ConfigError::ValidationError(
                "remote.max_edge must be > 0 when resizing".into(),
            ));
        }
        Ok(())
    }
}
