//! clipsort core: classify photos into fixed categories with CLIP.
//!
//! Images under a source folder are scored against category prompts by a
//! local ONNX CLIP model (or a remote vision model), then copied into an
//! export tree grouped by category.
//!
//! # Architecture
//!
//! ```text
//! Discover → Read → Score (session pool) → Route → Export → Store
//!                      └─ remote fallback (optional)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use clipsort_core::{Analyzer, Config};
//!
//! #[tokio::main]
//! async fn main() -> clipsort_core::Result<()> {
//!     let analyzer = Analyzer::new(Config::load()?);
//!     let job_id = analyzer.start_analysis("./photos".as_ref(), "./sorted".as_ref()).await?;
//!     let state = analyzer.wait(&job_id).await;
//!     println!("{state:?}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod job;
pub mod math;
pub mod output;
pub mod pipeline;
pub mod remote;
pub mod scoring;
pub mod service;
pub mod types;

// Re-exports for convenient access
pub use config::{AnalysisEngine, Config, JobConfig};
pub use embedding::{AccelCapabilities, AccelCapability, ProviderKind};
pub use error::{ClipsortError, ConfigError, JobError, PipelineError, PipelineResult, Result};
pub use job::{JobManager, JobTicket};
pub use output::{JobSummary, OutputFormat, OutputWriter};
pub use service::Analyzer;
pub use types::{
    CategoryKey, Distribution, DistributionMode, ExportStatus, JobState, JobStatus, PhotoDetail,
    PhotoResult, ScoreVector, StreamChunk, ValueStats,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
