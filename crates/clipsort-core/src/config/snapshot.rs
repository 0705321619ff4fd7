//! Immutable per-job configuration.

use std::path::PathBuf;

use super::{AnalysisEngine, Config, RemoteConfig};
use crate::embedding::EngineOptions;

/// Upper bound on workers and pooled sessions.
pub const MAX_CONCURRENCY: usize = 32;

/// Settings captured once when a job starts.
///
/// Changing the live [`Config`] after this point has no effect on the job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Worker count, clamped to `1..=MAX_CONCURRENCY`
    pub concurrency: usize,

    pub engine: AnalysisEngine,

    pub value_enabled: bool,

    /// Retry failed local classifications on the remote engine
    pub fallback_to_remote: bool,

    /// Live remote text streaming; forced off when `concurrency > 1`
    pub stream: bool,

    /// Extensions picked up by discovery
    pub supported_formats: Vec<String>,

    /// Local engine options (pool size equals `concurrency`)
    pub engine_options: EngineOptions,

    pub remote: RemoteConfig,

    pub model_dir: PathBuf,
}

impl JobConfig {
    /// Take a snapshot of `config`.
    pub fn from_config(config: &Config) -> Self {
        let concurrency = config.processing.concurrency.clamp(1, MAX_CONCURRENCY);
        let stream = config.remote.stream && concurrency == 1;
        if config.remote.stream && !stream {
            tracing::debug!(
                concurrency,
                "Remote streaming disabled: only one producer allowed"
            );
        }
        Self {
            concurrency,
            engine: config.analysis.engine,
            value_enabled: config.analysis.value_enabled,
            fallback_to_remote: config.analysis.fallback_to_remote,
            stream,
            supported_formats: config.processing.supported_formats.clone(),
            engine_options: config.engine_options(concurrency),
            remote: config.remote.clone(),
            model_dir: config.model_dir(),
        }
    }

    /// Whether this job needs the local CLIP engine.
    pub fn uses_local_engine(&self) -> bool {
        self.engine == AnalysisEngine::Clip
    }

    /// Whether this job may call the remote engine.
    pub fn uses_remote_engine(&self) -> bool {
        self.engine == AnalysisEngine::Remote || self.fallback_to_remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_is_clamped() {
        let mut config = Config::default();
        config.processing.concurrency = 0;
        assert_eq!(JobConfig::from_config(&config).concurrency, 1);

        config.processing.concurrency = 500;
        let snapshot = JobConfig::from_config(&config);
        assert_eq!(snapshot.concurrency, MAX_CONCURRENCY);
        assert_eq!(snapshot.engine_options.pool_size, MAX_CONCURRENCY);
    }

    #[test]
    fn test_streaming_disabled_above_one_worker() {
        let mut config = Config::default();
        config.remote.stream = true;

        config.processing.concurrency = 1;
        assert!(JobConfig::from_config(&config).stream);

        config.processing.concurrency = 2;
        assert!(!JobConfig::from_config(&config).stream);
    }

    #[test]
    fn test_snapshot_is_detached_from_config() {
        let mut config = Config::default();
        config.analysis.value_enabled = false;
        let snapshot = JobConfig::from_config(&config);

        config.analysis.value_enabled = true;
        assert!(!snapshot.value_enabled);
    }

    #[test]
    fn test_engine_usage() {
        let mut config = Config::default();
        let snapshot = JobConfig::from_config(&config);
        assert!(snapshot.uses_local_engine());
        assert!(!snapshot.uses_remote_engine());

        config.analysis.fallback_to_remote = true;
        assert!(JobConfig::from_config(&config).uses_remote_engine());

        config.analysis.engine = AnalysisEngine::Remote;
        let snapshot = JobConfig::from_config(&config);
        assert!(!snapshot.uses_local_engine());
        assert!(snapshot.uses_remote_engine());
    }
}
