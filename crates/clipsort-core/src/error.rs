//! Error types for the clipsort classification pipeline.
//!
//! Per-item failures (`PipelineError`) are recorded on the photo result and
//! counted; they never abort a job. Job-level failures (`JobError`) are
//! returned to the caller or end the job in the `error` state.

use std::path::PathBuf;
use thiserror::Error;

use crate::embedding::ProviderKind;

/// Top-level error type for clipsort operations.
#[derive(Error, Debug)]
pub enum ClipsortError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline processing errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Job lifecycle errors
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Pipeline errors: per-item failures and inference engine failures.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Image bytes could not be decoded or preprocessed
    #[error("Invalid image {path}: {message}")]
    InvalidImage { path: PathBuf, message: String },

    /// Reading the source file failed
    #[error("IO error for {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The format needs a system converter this platform lacks
    #[error("Unsupported {format} image {path}: no converter on this platform")]
    UnsupportedFormat { path: PathBuf, format: &'static str },

    /// An execution provider failed to build or warm up a session
    #[error("Execution provider {provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: ProviderKind,
        message: String,
    },

    /// Every provider candidate, CPU included, failed
    #[error("No execution provider could run the model: {message}")]
    EngineExhausted { message: String },

    /// Model or tokenizer file is missing
    #[error("Model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    /// Inference or tokenization failed
    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    /// Remote vision model unreachable, rejected the request, or returned garbage
    #[error("Remote engine error: {message}")]
    RemoteEngine {
        message: String,
        status_code: Option<u16>,
    },

    /// Operation timed out
    #[error("Timeout in {stage} stage for {path} after {timeout_ms}ms")]
    Timeout {
        path: PathBuf,
        stage: String,
        timeout_ms: u64,
    },

    /// Copying into the export tree failed
    #[error("Export failed for {path}: {message}")]
    Export { path: PathBuf, message: String },
}

/// Job lifecycle errors surfaced to the caller.
#[derive(Error, Debug)]
pub enum JobError {
    /// A job is already running; the new start request is rejected
    #[error("Job {job_id} is already running")]
    AlreadyRunning { job_id: String },

    /// Source or export root is empty or unusable
    #[error("Invalid {role} root: {path:?}")]
    InvalidRoot { role: &'static str, path: PathBuf },

    /// No record with the given id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The inference engine could not be built for this job
    #[error("Engine unavailable: {0}")]
    Engine(#[source] PipelineError),
}

/// Convenience type alias for clipsort results.
pub type Result<T> = std::result::Result<T, ClipsortError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
