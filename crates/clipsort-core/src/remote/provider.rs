//! Remote classifier trait and request/response types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::broadcast;

use crate::config::RemoteConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{CategoryKey, ScoreVector, StreamChunk};

/// Base64-encoded image ready to send to a vision model.
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// Base64-encoded image bytes
    pub data: String,
    /// MIME type of the encoded bytes
    pub media_type: String,
}

impl ImageInput {
    /// Wrap JPEG bytes produced by the upload encoder.
    pub fn from_jpeg(bytes: &[u8]) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            media_type: "image/jpeg".to_string(),
        }
    }
}

/// Forwards partial model output for one item.
///
/// Only handed out when the job runs a single producer.
#[derive(Debug, Clone)]
pub struct StreamSink {
    pub job_id: String,
    pub file_name: String,
    pub tx: broadcast::Sender<StreamChunk>,
}

impl StreamSink {
    fn send(&self, delta: &str, done: bool, reset: bool) {
        // No subscribers is fine.
        let _ = self.tx.send(StreamChunk {
            job_id: self.job_id.clone(),
            file_name: self.file_name.clone(),
            delta: delta.to_string(),
            done,
            reset,
        });
    }

    /// Start of a new item's output.
    pub fn reset(&self) {
        self.send("", false, true);
    }

    pub fn delta(&self, text: &str) {
        if !text.is_empty() {
            self.send(text, false, false);
        }
    }

    pub fn done(&self) {
        self.send("", true, false);
    }
}

/// One image to classify remotely.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub image: ImageInput,
    /// Source path, for error reporting
    pub path: PathBuf,
    pub file_name: String,
    pub prompt: String,
    pub stream: Option<StreamSink>,
}

impl RemoteRequest {
    /// Build a classification request for an already-encoded image.
    pub fn classify_image(image: ImageInput, path: PathBuf, file_name: String) -> Self {
        Self {
            image,
            path,
            file_name,
            prompt: classification_prompt(),
            stream: None,
        }
    }

    pub fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }
}

/// User prompt listing the closed category set.
pub fn classification_prompt() -> String {
    let keys: Vec<&str> = CategoryKey::ALL.iter().map(|k| k.as_str()).collect();
    format!(
        "Classify this photo into exactly one of these categories: {}.\n\
         Return JSON with \"category\" (one of the keys), \"scores\" (a number \
         between 0 and 1 for every key, summing to 1) and \"caption\" (one short \
         English sentence describing the photo).",
        keys.join(", ")
    )
}

/// A parsed remote classification.
#[derive(Debug, Clone)]
pub struct RemoteVerdict {
    pub scores: ScoreVector,
    pub category: CategoryKey,
    pub caption: Option<String>,
    /// Model identifier used
    pub model: String,
    /// Unparsed model output
    pub raw: String,
    /// Round-trip latency in milliseconds
    pub latency_ms: u64,
}

/// Trait that all remote classifiers implement.
///
/// `async_trait` keeps it object-safe for `Arc<dyn RemoteClassifier>`.
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    /// Classifier name for logging.
    fn name(&self) -> &str;

    async fn classify(&self, request: &RemoteRequest) -> PipelineResult<RemoteVerdict>;

    /// Per-request timeout.
    fn timeout(&self) -> Duration;
}

/// Create the configured remote classifier.
pub fn create_classifier(config: &RemoteConfig) -> Arc<dyn RemoteClassifier> {
    Arc::new(super::ollama::OllamaClassifier::new(config))
}

/// Run `classify` under the classifier's own timeout.
///
/// Expiry becomes a per-item `Timeout` error.
pub async fn classify_with_timeout(
    classifier: &dyn RemoteClassifier,
    request: &RemoteRequest,
) -> PipelineResult<RemoteVerdict> {
    let timeout = classifier.timeout();
    match tokio::time::timeout(timeout, classifier.classify(request)).await {
        Ok(result) => result,
        Err(_) => {
            if let Some(sink) = &request.stream {
                sink.done();
            }
            Err(PipelineError::Timeout {
                path: request.path.clone(),
                stage: "remote".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}
