//! Scripted remote classifier for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::provider::{RemoteClassifier, RemoteRequest, RemoteVerdict};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{CategoryKey, ScoreVector};

pub(crate) struct MockClassifier {
    category: CategoryKey,
    fail: Option<String>,
    delay: Option<Duration>,
    timeout: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockClassifier {
    pub fn new(category: CategoryKey) -> Self {
        Self {
            category,
            fail: None,
            delay: None,
            timeout: Duration::from_secs(10),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::new(CategoryKey::Other)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl RemoteClassifier for MockClassifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn classify(&self, request: &RemoteRequest) -> PipelineResult<RemoteVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.fail {
            return Err(PipelineError::RemoteEngine {
                message: message.clone(),
                status_code: Some(503),
            });
        }
        if let Some(sink) = &request.stream {
            sink.reset();
            sink.delta(self.category.as_str());
            sink.done();
        }
        Ok(RemoteVerdict {
            scores: ScoreVector::one_hot(self.category),
            category: self.category,
            caption: Some(format!("mock caption for {}", request.file_name)),
            model: "mock-vlm".to_string(),
            raw: format!("{{\"category\":\"{}\"}}", self.category),
            latency_ms: 1,
        })
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
