//! CLIP inference: sessions, execution providers and the session pool.
//!
//! The model is a single combined CLIP graph that produces both image and
//! text embeddings. Sessions are built through a [`SessionFactory`] so the
//! pool and the capability detector can be exercised without model files.
//!
//! # Usage
//!
//! ```rust,ignore
//! use clipsort_core::embedding::{build_with_fallback, DemotedProviders, OrtSessionFactory};
//!
//! let options = config.engine_options(4);
//! let (provider, sessions) =
//!     build_with_fallback(&OrtSessionFactory, &options, &DemotedProviders::global())?;
//! let pool = SessionPool::new(provider, sessions);
//! let mut session = pool.acquire().await?;
//! let embedding = session.embed_image(&pixels)?;
//! ```

pub mod capability;
pub mod clip;
pub mod pool;
pub mod preprocess;
pub mod provider;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::path::PathBuf;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::config::AccelConfig;
use crate::error::{PipelineError, PipelineResult};

pub use capability::{AccelCapabilities, AccelCapability, CapabilityDetector};
pub use clip::OrtSessionFactory;
pub use pool::{build_with_fallback, PooledSession, SessionPool};
pub use provider::{DemotedProviders, ProviderChain};

/// Tokenizer file expected next to the `onnx/` directory.
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Text embedded during warmup.
pub const WARMUP_PROMPT: &str = "a photo";

/// Execution provider kinds, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Cpu,
    CoreMl,
    Cuda,
    Rocm,
    DirectMl,
    OpenVino,
}

impl ProviderKind {
    /// Every provider, accelerators first in preference order, CPU last.
    pub const PREFERENCE: [ProviderKind; 6] = [
        ProviderKind::CoreMl,
        ProviderKind::Cuda,
        ProviderKind::Rocm,
        ProviderKind::DirectMl,
        ProviderKind::OpenVino,
        ProviderKind::Cpu,
    ];

    pub fn is_accelerator(self) -> bool {
        self != ProviderKind::Cpu
    }

    /// Config key (`[accel]` field name).
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Cpu => "cpu",
            ProviderKind::CoreMl => "coreml",
            ProviderKind::Cuda => "cuda",
            ProviderKind::Rocm => "rocm",
            ProviderKind::DirectMl => "directml",
            ProviderKind::OpenVino => "openvino",
        }
    }

    /// Human-readable name.
    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Cpu => "CPU",
            ProviderKind::CoreMl => "CoreML",
            ProviderKind::Cuda => "CUDA",
            ProviderKind::Rocm => "ROCm",
            ProviderKind::DirectMl => "DirectML",
            ProviderKind::OpenVino => "OpenVINO",
        }
    }

    /// Whether the user toggle for this provider is on. CPU is always on.
    pub fn enabled_in(self, accel: &AccelConfig) -> bool {
        match self {
            ProviderKind::Cpu => true,
            ProviderKind::CoreMl => accel.coreml,
            ProviderKind::Cuda => accel.cuda,
            ProviderKind::Rocm => accel.rocm,
            ProviderKind::DirectMl => accel.directml,
            ProviderKind::OpenVino => accel.openvino,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Everything needed to build the sessions of one pool.
///
/// Also the cache key of a built engine: two jobs with equal options share
/// sessions and prompt embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineOptions {
    pub model_dir: PathBuf,
    /// Model file relative to `model_dir`
    pub model_file: String,
    pub image_size: u32,
    pub pool_size: usize,
    pub intra_threads: usize,
    pub accel: AccelConfig,
}

impl EngineOptions {
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.model_dir.join(TOKENIZER_FILENAME)
    }

    /// Both the model and the tokenizer exist on disk.
    pub fn model_present(&self) -> bool {
        self.model_path().is_file() && self.tokenizer_path().is_file()
    }
}

/// One exclusive inference session over the combined CLIP graph.
///
/// Implementations return L2-normalized embeddings.
pub trait ClipSession: Send {
    /// Embed a `[1, 3, S, S]` normalized pixel tensor.
    fn embed_image(&mut self, pixels: &Array4<f32>) -> PipelineResult<Vec<f32>>;

    /// Embed a batch of prompts, one vector per prompt.
    fn embed_texts(&mut self, prompts: &[&str]) -> PipelineResult<Vec<Vec<f32>>>;
}

/// Builds sessions bound to a single execution provider.
pub trait SessionFactory: Send + Sync {
    /// The provider was compiled in and the platform can run it.
    fn compiled_in(&self, kind: ProviderKind) -> bool {
        clip::provider_supported(kind)
    }

    /// Cheap runtime check used when no model is available to build with.
    fn runtime_available(&self, kind: ProviderKind) -> bool {
        clip::runtime_available(kind)
    }

    /// Build one session. Registration failures are `ProviderUnavailable`.
    fn build(
        &self,
        kind: ProviderKind,
        options: &EngineOptions,
    ) -> PipelineResult<Box<dyn ClipSession>>;
}

/// Smoke-test a freshly built session with one prompt and one blank image.
pub fn warmup(session: &mut dyn ClipSession, image_size: u32) -> PipelineResult<()> {
    let texts = session.embed_texts(&[WARMUP_PROMPT])?;
    let size = image_size as usize;
    let pixels = Array4::<f32>::zeros((1, 3, size, size));
    let image = session.embed_image(&pixels)?;

    let text = texts.first().ok_or_else(|| PipelineError::Embedding {
        message: "warmup produced no text embedding".to_string(),
    })?;
    if image.is_empty() || text.len() != image.len() {
        return Err(PipelineError::Embedding {
            message: format!(
                "warmup embedding size mismatch (image {}, text {})",
                image.len(),
                text.len()
            ),
        });
    }
    if image.iter().chain(text.iter()).any(|v| !v.is_finite()) {
        return Err(PipelineError::Embedding {
            message: "warmup produced non-finite values".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::mock::MockFactory;
    use super::*;

    #[test]
    fn test_preference_puts_cpu_last() {
        assert_eq!(ProviderKind::PREFERENCE.last(), Some(&ProviderKind::Cpu));
        assert!(ProviderKind::PREFERENCE[..5]
            .iter()
            .all(|k| k.is_accelerator()));
    }

    #[test]
    fn test_enabled_in_follows_toggles() {
        let accel = AccelConfig {
            auto: true,
            coreml: false,
            cuda: true,
            rocm: false,
            directml: false,
            openvino: false,
        };
        assert!(ProviderKind::Cpu.enabled_in(&accel));
        assert!(ProviderKind::Cuda.enabled_in(&accel));
        assert!(!ProviderKind::CoreMl.enabled_in(&accel));
    }

    #[test]
    fn test_provider_kind_serializes_as_config_key() {
        let json = serde_json::to_string(&ProviderKind::OpenVino).unwrap();
        assert_eq!(json, "\"openvino\"");
        assert_eq!(ProviderKind::OpenVino.to_string(), "OpenVINO");
    }

    #[test]
    fn test_warmup_passes_on_healthy_session() {
        let factory = MockFactory::new();
        let options = mock::options(1);
        let mut session = factory.build(ProviderKind::Cpu, &options).unwrap();
        assert!(warmup(session.as_mut(), options.image_size).is_ok());
    }

    #[test]
    fn test_warmup_surfaces_inference_failure() {
        let factory = MockFactory::new().fail_warmup(ProviderKind::Cuda);
        let options = mock::options(1);
        let mut session = factory.build(ProviderKind::Cuda, &options).unwrap();
        assert!(warmup(session.as_mut(), options.image_size).is_err());
    }
}
