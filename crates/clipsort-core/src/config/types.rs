//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of logical cores, at least 1.
pub(crate) fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(1)
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding `tokenizer.json` and the `onnx/` model files
    pub model_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("~/.clipsort/models/clip-vit-b32-onnx"),
        }
    }
}

/// Processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of concurrent workers (and pooled sessions), clamped to 1..=32
    pub concurrency: usize,

    /// Supported input formats
    pub supported_formats: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: available_cores().min(4),
            supported_formats: vec![
                "png".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "webp".to_string(),
                "heic".to_string(),
                "dng".to_string(),
            ],
        }
    }
}

/// Which engine classifies images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisEngine {
    /// Local CLIP model via ONNX Runtime
    #[default]
    Clip,
    /// Remote vision-language model (Ollama)
    Remote,
}

/// Analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Primary engine
    pub engine: AnalysisEngine,

    /// Compute the keep/drop judgment and split the export tree by it
    pub value_enabled: bool,

    /// Retry an item on the remote engine when the local engine fails on it
    pub fallback_to_remote: bool,
}

/// CLIP model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// ONNX file relative to the model directory
    pub model_file: String,

    /// Square input size of the vision tower
    pub image_size: u32,

    /// ONNX intra-op threads per session. 0 derives it from cores / pool size.
    pub intra_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_file: "onnx/model_q4f16.onnx".to_string(),
            image_size: 224,
            intra_threads: 0,
        }
    }
}

/// Execution provider toggles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Try enabled accelerators before CPU. When false only CPU is used.
    pub auto: bool,
    pub coreml: bool,
    pub cuda: bool,
    pub rocm: bool,
    pub directml: bool,
    pub openvino: bool,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            auto: true,
            coreml: cfg!(target_vendor = "apple"),
            cuda: false,
            rocm: false,
            directml: false,
            openvino: false,
        }
    }
}

/// Remote vision model (Ollama) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Ollama API endpoint
    pub endpoint: String,

    /// Model name
    pub model: String,

    /// Stream partial output (only honored when concurrency is 1)
    pub stream: bool,

    /// Allow the model's thinking phase
    pub think: bool,

    /// Downscale images before upload
    pub resize_enabled: bool,

    /// Longest edge after downscaling
    pub max_edge: u32,

    /// JPEG quality of the uploaded image (1-100)
    pub jpeg_quality: u8,

    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5vl:7b".to_string(),
            stream: false,
            think: false,
            resize_enabled: true,
            max_edge: 768,
            jpeg_quality: 60,
            timeout_ms: 60_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
