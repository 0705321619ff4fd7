//! Classification pipeline components.
//!
//! - **discovery**: Find image files under the source root
//! - **decode**: Read sources, sniff formats, re-encode for upload
//! - **engine**: Session pool plus prompt embeddings for local scoring
//! - **export**: Route classified files into the export tree
//! - **store**: Recorded results and aggregates over them
//! - **orchestrator**: Runs a job across bounded workers

pub mod decode;
pub mod discovery;
pub mod engine;
pub mod export;
pub mod orchestrator;
pub mod store;

// Re-exports for convenient access
pub use decode::{RawFormat, UploadOptions};
pub use discovery::{DiscoveredFile, FileDiscovery};
pub use engine::{ClipEngine, LocalVerdict, CLIP_MODEL_LABEL};
pub use export::{count_exported, ExportRoute, Exporter, FsExporter};
pub use orchestrator::{run_job, JobContext};
pub use store::{MemoryStore, PhotoRecord, ResultStore};
