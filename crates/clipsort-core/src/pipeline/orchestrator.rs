//! Runs one job: discover sources, classify each on a bounded set of workers,
//! export, record and publish progress.
//!
//! Per-item failures become error records and never stop the job. Workers
//! check the cancel flag before starting an item; items already started
//! finish normally.

use std::fmt::{Display, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

use super::decode::{encode_for_upload, read_source, UploadOptions};
use super::discovery::{DiscoveredFile, FileDiscovery};
use super::engine::{ClipEngine, CLIP_MODEL_LABEL};
use super::export::{ExportRoute, Exporter};
use super::store::{PhotoRecord, ResultStore};
use crate::config::{AnalysisEngine, JobConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::job::JobTicket;
use crate::remote::{classify_with_timeout, ImageInput, RemoteClassifier, RemoteRequest, StreamSink};
use crate::scoring::{Scorer, ValueJudgment};
use crate::types::{CategoryKey, ExportStatus, JobStatus, PhotoResult, ScoreVector, StreamChunk};

/// Everything a job run needs, fixed at start.
pub struct JobContext {
    pub config: JobConfig,
    pub source_root: PathBuf,
    pub export_root: PathBuf,
    /// Present when the job scores locally
    pub engine: Option<Arc<ClipEngine>>,
    /// Present when the job may call the remote engine
    pub remote: Option<Arc<dyn RemoteClassifier>>,
    pub store: Arc<dyn ResultStore>,
    pub exporter: Arc<dyn Exporter>,
    pub stream: broadcast::Sender<StreamChunk>,
}

/// A verdict from either engine.
struct Classified {
    scores: ScoreVector,
    category: CategoryKey,
    top_score: f32,
    value: Option<ValueJudgment>,
    model: String,
}

/// `key: value` lines kept with each record.
#[derive(Default)]
struct AnalysisLog(String);

impl AnalysisLog {
    fn field(&mut self, key: &str, value: impl Display) {
        let _ = writeln!(self.0, "{key}: {value}");
    }
}

#[derive(Clone)]
struct Worker {
    ctx: Arc<JobContext>,
    scorer: Option<Scorer>,
    job_id: String,
}

/// Run a job to a terminal state and return it.
pub async fn run_job(ctx: JobContext, ticket: Arc<JobTicket>) -> JobStatus {
    let start = Instant::now();
    let ctx = Arc::new(ctx);
    let concurrency = ctx.config.concurrency;

    let files = {
        let formats = ctx.config.supported_formats.clone();
        let source = ctx.source_root.clone();
        let export = ctx.export_root.clone();
        match tokio::task::spawn_blocking(move || {
            FileDiscovery::new(&formats).excluding(&export).discover(&source)
        })
        .await
        {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(job_id = %ticket.job_id, "Discovery task failed: {e}");
                return ticket.progress.fail().status;
            }
        }
    };
    let total = files.len();
    ticket.progress.set_total(total);
    tracing::info!(
        job_id = %ticket.job_id,
        total,
        bytes = FileDiscovery::total_size(&files),
        concurrency,
        engine = ?ctx.config.engine,
        value = ctx.config.value_enabled,
        "Analyzing"
    );

    let worker = Worker {
        scorer: ctx
            .engine
            .as_ref()
            .map(|engine| engine.scorer(ctx.config.value_enabled)),
        ctx: Arc::clone(&ctx),
        job_id: ticket.job_id.clone(),
    };

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::with_capacity(total);

    for file in files {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            tracing::warn!("Worker semaphore closed unexpectedly, stopping job");
            break;
        };
        if ticket.cancel.is_canceled() {
            break;
        }

        let worker = worker.clone();
        let ticket = Arc::clone(&ticket);
        let file_name = file.file_name();
        let handle = tokio::spawn(async move {
            if ticket.cancel.is_canceled() {
                return;
            }
            let record = worker.process(&file).await;
            let failed = record.result.export_status == ExportStatus::Error;
            let name = record.result.file_name.clone();
            worker.ctx.store.append(record);
            ticket.progress.record(&name, failed);
            drop(permit);
        });
        handles.push((file_name, handle));
    }

    for (file_name, handle) in handles {
        if let Err(e) = handle.await {
            tracing::error!(file = %file_name, "Worker panicked: {e}");
            ticket.progress.record(&file_name, true);
        }
    }

    let state = ticket.progress.state();
    let status = if ticket.cancel.is_canceled() && state.processed < state.total {
        JobStatus::Canceled
    } else {
        JobStatus::Completed
    };
    let state = ticket.progress.finish(status);

    let elapsed = start.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        state.processed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    tracing::info!(
        job_id = %state.job_id,
        status = ?state.status,
        processed = state.processed,
        total = state.total,
        errors = state.errors,
        elapsed_ms = elapsed.as_millis() as u64,
        "Job finished ({rate:.1} images/sec)"
    );
    state.status
}

impl Worker {
    async fn process(&self, file: &DiscoveredFile) -> PhotoRecord {
        let start = Instant::now();
        let file_name = file.file_name();
        let mut log = AnalysisLog::default();
        log.field("engine", engine_label(self.ctx.config.engine));

        let classified = match read_source(&file.path).await {
            Ok(bytes) => self.classify(bytes, file, &file_name, &mut log).await,
            Err(e) => Err(e),
        };

        let mut result = match classified {
            Ok(classified) => {
                let route = ExportRoute {
                    category: classified.category,
                    valuable: classified.value.map(|v| v.is_valuable),
                };
                log.field("export_dir", route.relative_dir().display());
                match self.export(route, &file_name, &file.path).await {
                    Ok(target) => success_result(&file_name, classified, &target),
                    Err(e) => {
                        let mut result = success_result(&file_name, classified, &file.path);
                        result.export_status = ExportStatus::Error;
                        result.error_message = Some(e.to_string());
                        result
                    }
                }
            }
            Err(e) => failed_result(file, &file_name, &e, self.ctx.config.engine),
        };

        result.duration_ms = start.elapsed().as_millis() as u64;
        log.field("duration_ms", result.duration_ms);
        if let Some(message) = &result.error_message {
            tracing::debug!(file = %file_name, error = %message, "Item failed");
            log.field("error", message);
        } else {
            tracing::trace!(
                file = %file_name,
                category = %result.category,
                duration_ms = result.duration_ms,
                "Item done"
            );
        }

        PhotoRecord {
            result,
            analysis_log: log.0,
        }
    }

    async fn classify(
        &self,
        bytes: Vec<u8>,
        file: &DiscoveredFile,
        file_name: &str,
        log: &mut AnalysisLog,
    ) -> PipelineResult<Classified> {
        let local = match (&self.ctx.engine, &self.scorer) {
            (Some(engine), Some(scorer)) if self.ctx.config.engine == AnalysisEngine::Clip => {
                Some((engine, scorer))
            }
            _ => None,
        };

        let Some((engine, scorer)) = local else {
            let remote = self.remote()?;
            return self.classify_remote(remote, bytes, file, file_name, log).await;
        };

        let fallback = if self.ctx.config.fallback_to_remote {
            self.ctx.remote.as_ref().map(|remote| (remote, bytes.clone()))
        } else {
            None
        };

        let local_err = match engine.classify(scorer, bytes, file.path.clone()).await {
            Ok(local) => {
                log.field("provider", local.provider);
                log.field("pool_wait_ms", local.wait_ms);
                log.field("vision_infer_ms", local.infer_ms);
                if let Some(value) = local.verdict.value {
                    log.field("keep_prob", format!("{:.4}", value.keep_prob));
                }
                let verdict = local.verdict;
                return Ok(Classified {
                    scores: verdict.scores,
                    category: verdict.category,
                    top_score: verdict.top_score,
                    value: verdict.value,
                    model: CLIP_MODEL_LABEL.to_string(),
                });
            }
            Err(e) => e,
        };

        let Some((remote, bytes)) = fallback else {
            return Err(local_err);
        };
        tracing::warn!(file = %file_name, error = %local_err, "CLIP failed, retrying on remote engine");
        log.field("clip_error", &local_err);
        log.field("fallback", remote.name());

        self.classify_remote(remote, bytes, file, file_name, log)
            .await
            .map_err(|remote_err| PipelineError::RemoteEngine {
                message: format!("clip: {local_err}; remote fallback: {remote_err}"),
                status_code: None,
            })
    }

    fn remote(&self) -> PipelineResult<&Arc<dyn RemoteClassifier>> {
        self.ctx.remote.as_ref().ok_or_else(|| PipelineError::RemoteEngine {
            message: "no remote engine configured".to_string(),
            status_code: None,
        })
    }

    async fn classify_remote(
        &self,
        remote: &Arc<dyn RemoteClassifier>,
        bytes: Vec<u8>,
        file: &DiscoveredFile,
        file_name: &str,
        log: &mut AnalysisLog,
    ) -> PipelineResult<Classified> {
        let upload = UploadOptions::from(&self.ctx.config.remote);
        let path = file.path.clone();
        let jpeg = tokio::task::spawn_blocking(move || encode_for_upload(&bytes, &path, upload))
            .await
            .map_err(|e| PipelineError::InvalidImage {
                path: file.path.clone(),
                message: format!("encode task failed: {e}"),
            })??;

        let mut request = RemoteRequest::classify_image(
            ImageInput::from_jpeg(&jpeg),
            file.path.clone(),
            file_name.to_string(),
        );
        if self.ctx.config.stream {
            request = request.with_stream(StreamSink {
                job_id: self.job_id.clone(),
                file_name: file_name.to_string(),
                tx: self.ctx.stream.clone(),
            });
        }

        let verdict = classify_with_timeout(remote.as_ref(), &request).await?;
        log.field("remote", remote.name());
        log.field("remote_model", &verdict.model);
        log.field("upload_bytes", jpeg.len());
        log.field("remote_latency_ms", verdict.latency_ms);
        if let Some(caption) = &verdict.caption {
            log.field("caption", caption);
        }
        log.field("raw", verdict.raw.trim());

        Ok(Classified {
            top_score: verdict.scores.get(verdict.category),
            scores: verdict.scores,
            category: verdict.category,
            value: None,
            model: verdict.model,
        })
    }

    async fn export(
        &self,
        route: ExportRoute,
        file_name: &str,
        source: &Path,
    ) -> PipelineResult<PathBuf> {
        let exporter = Arc::clone(&self.ctx.exporter);
        let root = self.ctx.export_root.clone();
        let name = file_name.to_string();
        let src = source.to_path_buf();
        tokio::task::spawn_blocking(move || exporter.export(&root, route, &name, &src))
            .await
            .map_err(|e| PipelineError::Export {
                path: source.to_path_buf(),
                message: format!("export task failed: {e}"),
            })?
    }
}

fn engine_label(engine: AnalysisEngine) -> &'static str {
    match engine {
        AnalysisEngine::Clip => "clip",
        AnalysisEngine::Remote => "remote",
    }
}

fn success_result(
    file_name: &str,
    classified: Classified,
    path: &Path,
) -> PhotoResult {
    PhotoResult {
        id: Uuid::new_v4().to_string(),
        path: path.to_string_lossy().into_owned(),
        file_name: file_name.to_string(),
        category: classified.category,
        top_score: classified.top_score,
        scores: classified.scores,
        export_status: ExportStatus::Success,
        error_message: None,
        duration_ms: 0,
        model: Some(classified.model),
        is_valuable: classified.value.map(|v| v.is_valuable),
        valuable_score: classified.value.map(|v| v.keep_prob),
    }
}

fn failed_result(
    file: &DiscoveredFile,
    file_name: &str,
    error: &PipelineError,
    engine: AnalysisEngine,
) -> PhotoResult {
    PhotoResult {
        id: Uuid::new_v4().to_string(),
        path: file.path.to_string_lossy().into_owned(),
        file_name: file_name.to_string(),
        category: CategoryKey::Other,
        top_score: 0.0,
        scores: ScoreVector::unscored(),
        export_status: ExportStatus::Error,
        error_message: Some(error.to_string()),
        duration_ms: 0,
        model: Some(engine_label(engine).to_string()),
        is_valuable: None,
        valuable_score: None,
    }
}
