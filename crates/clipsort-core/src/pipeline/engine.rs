//! The local CLIP engine: a warmed session pool plus its prompt embeddings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::embedding::{
    build_with_fallback, DemotedProviders, EngineOptions, ProviderKind, SessionFactory,
    SessionPool,
};
use crate::error::{PipelineError, PipelineResult};
use crate::scoring::{PromptEmbeddings, Scorer, Verdict};

/// Model label recorded on results scored locally.
pub const CLIP_MODEL_LABEL: &str = "clip-vit-b32-onnx";

/// Everything a job needs to score images locally. Built once per
/// [`EngineOptions`] and shared across jobs.
pub struct ClipEngine {
    pool: SessionPool,
    prompts: Arc<PromptEmbeddings>,
    options: EngineOptions,
}

/// One local classification with its timing breakdown.
#[derive(Debug, Clone)]
pub struct LocalVerdict {
    pub verdict: Verdict,
    pub provider: ProviderKind,
    pub wait_ms: u64,
    pub infer_ms: u64,
}

impl ClipEngine {
    /// Build the pool with provider fallback, then embed the prompts on the
    /// first session.
    ///
    /// Blocking: call from `spawn_blocking`.
    pub fn build(
        factory: &dyn SessionFactory,
        options: &EngineOptions,
        demoted: &DemotedProviders,
    ) -> PipelineResult<Self> {
        let start = Instant::now();
        let (provider, mut sessions) = build_with_fallback(factory, options, demoted)?;

        let first = sessions
            .first_mut()
            .ok_or_else(|| PipelineError::EngineExhausted {
                message: "provider produced no sessions".to_string(),
            })?;
        let prompts = PromptEmbeddings::compute(first.as_mut())?;

        tracing::info!(
            provider = %provider,
            pool_size = sessions.len(),
            dim = prompts.dim(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "CLIP engine ready"
        );

        Ok(Self {
            pool: SessionPool::new(provider, sessions),
            prompts: Arc::new(prompts),
            options: options.clone(),
        })
    }

    pub fn scorer(&self, value_enabled: bool) -> Scorer {
        Scorer::new(Arc::clone(&self.prompts), value_enabled)
    }

    /// Check out a session, score `bytes` on a blocking thread, return the session.
    pub async fn classify(
        &self,
        scorer: &Scorer,
        bytes: Vec<u8>,
        path: PathBuf,
    ) -> PipelineResult<LocalVerdict> {
        let wait_start = Instant::now();
        let mut session = self.pool.acquire().await?;
        let wait_ms = wait_start.elapsed().as_millis() as u64;

        let scorer = scorer.clone();
        let image_size = self.options.image_size;
        let infer_start = Instant::now();
        let verdict = tokio::task::spawn_blocking(move || {
            scorer.score_bytes(&mut *session, &bytes, &path, image_size)
        })
        .await
        .map_err(|e| PipelineError::Embedding {
            message: format!("inference task failed: {e}"),
        })??;

        Ok(LocalVerdict {
            verdict,
            provider: self.pool.provider(),
            wait_ms,
            infer_ms: infer_start.elapsed().as_millis() as u64,
        })
    }

    pub fn provider(&self) -> ProviderKind {
        self.pool.provider()
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}
