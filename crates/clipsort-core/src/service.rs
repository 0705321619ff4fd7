//! The command surface: start/cancel jobs, read progress and results.
//!
//! An [`Analyzer`] owns the job manager, the result store and a cached CLIP
//! engine. The engine is reused across jobs while its [`EngineOptions`] stay
//! the same and rebuilt when they change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, JobConfig};
use crate::embedding::{
    AccelCapabilities, CapabilityDetector, DemotedProviders, EngineOptions, OrtSessionFactory,
    SessionFactory,
};
use crate::error::{JobError, PipelineError, Result};
use crate::job::{JobManager, JobTicket};
use crate::pipeline::store::{distribution_from_counts, distribution_from_results, value_stats};
use crate::pipeline::{
    count_exported, run_job, ClipEngine, Exporter, FsExporter, JobContext, MemoryStore,
    ResultStore,
};
use crate::remote::{create_classifier, RemoteClassifier};
use crate::types::{
    Distribution, DistributionMode, JobState, PhotoDetail, PhotoResult, StreamChunk, ValueStats,
};

/// Buffered stream chunks per subscriber.
const STREAM_BUFFER: usize = 1024;

type EngineCache = tokio::sync::Mutex<Option<(EngineOptions, Arc<ClipEngine>)>>;

/// What `get_distribution` needs to know about the last job.
#[derive(Debug, Clone)]
struct LastJob {
    export_root: PathBuf,
    value_enabled: bool,
}

/// Entry point for callers: one instance per process.
pub struct Analyzer {
    config: RwLock<Config>,
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn ResultStore>,
    exporter: Arc<dyn Exporter>,
    remote: Option<Arc<dyn RemoteClassifier>>,
    demoted: DemotedProviders,
    jobs: JobManager,
    engine: Arc<EngineCache>,
    stream: broadcast::Sender<StreamChunk>,
    last_job: Mutex<Option<LastJob>>,
    task: Mutex<Option<(String, JoinHandle<()>)>>,
}

impl Analyzer {
    /// An analyzer running ONNX sessions, storing results in memory.
    pub fn new(config: Config) -> Self {
        let (stream, _) = broadcast::channel(STREAM_BUFFER);
        Self {
            config: RwLock::new(config),
            factory: Arc::new(OrtSessionFactory),
            store: Arc::new(MemoryStore::new()),
            exporter: Arc::new(FsExporter),
            remote: None,
            demoted: DemotedProviders::global(),
            jobs: JobManager::new(),
            engine: Arc::new(tokio::sync::Mutex::new(None)),
            stream,
            last_job: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Use this classifier instead of one built from `[remote]` settings.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteClassifier>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Track demoted providers separately from the process-wide set.
    pub fn with_demoted(mut self, demoted: DemotedProviders) -> Self {
        self.demoted = demoted;
        self
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the live settings. Running jobs keep their snapshot.
    pub fn set_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(())
    }

    /// Start a job over `source_root`, exporting into `export_root`.
    ///
    /// Returns once the job is registered; the work runs as a task on the
    /// caller's runtime. Fails if a root is unusable or another job is running.
    pub async fn start_analysis(&self, source_root: &Path, export_root: &Path) -> Result<String> {
        if source_root.as_os_str().is_empty() || !source_root.is_dir() {
            return Err(JobError::InvalidRoot {
                role: "source",
                path: source_root.to_path_buf(),
            }
            .into());
        }
        if export_root.as_os_str().is_empty() || std::fs::create_dir_all(export_root).is_err() {
            return Err(JobError::InvalidRoot {
                role: "export",
                path: export_root.to_path_buf(),
            }
            .into());
        }

        let config = JobConfig::from_config(&self.config());
        let ticket = Arc::new(self.jobs.start()?);
        let job_id = ticket.job_id.clone();

        *self.last_job.lock().unwrap_or_else(|e| e.into_inner()) = Some(LastJob {
            export_root: export_root.to_path_buf(),
            value_enabled: config.value_enabled,
        });

        let remote = config.uses_remote_engine().then(|| {
            self.remote
                .clone()
                .unwrap_or_else(|| create_classifier(&config.remote))
        });
        let ctx = JobContext {
            config,
            source_root: source_root.to_path_buf(),
            export_root: export_root.to_path_buf(),
            engine: None,
            remote,
            store: Arc::clone(&self.store),
            exporter: Arc::clone(&self.exporter),
            stream: self.stream.clone(),
        };

        let handle = tokio::spawn(run_with_engine(
            ctx,
            ticket,
            Arc::clone(&self.factory),
            Arc::clone(&self.engine),
            self.demoted.clone(),
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some((job_id.clone(), handle));

        Ok(job_id)
    }

    /// Cooperatively cancel `job_id`. No-op for any other id.
    pub fn cancel_analysis(&self, job_id: &str) {
        self.jobs.cancel(job_id);
    }

    /// Wait for `job_id` to end and return its final state.
    pub async fn wait(&self, job_id: &str) -> Option<JobState> {
        let handle = {
            let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
            match task.take() {
                Some((id, handle)) if id == job_id => Some(handle),
                other => {
                    *task = other;
                    None
                }
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(%job_id, "Job task failed: {e}");
            }
        }
        self.jobs.snapshot().filter(|s| s.job_id == job_id)
    }

    pub fn get_progress(&self) -> Option<JobState> {
        self.jobs.snapshot()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<JobState> {
        self.jobs.subscribe()
    }

    /// Live remote text; only produced by single-worker jobs.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<StreamChunk> {
        self.stream.subscribe()
    }

    pub fn list_photos(&self) -> Vec<PhotoResult> {
        self.store.list()
    }

    pub fn get_photo_detail(&self, id: &str) -> Result<PhotoDetail> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| JobError::NotFound(format!("photo {id}")))?;
        Ok(PhotoDetail {
            result: record.result,
            analysis_log: record.analysis_log,
        })
    }

    /// Per-category aggregate. After a value-split job this counts the
    /// export tree instead of the stored scores.
    pub fn get_distribution(&self, mode: DistributionMode) -> Distribution {
        let last = self.last_job.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match last {
            Some(last) if last.value_enabled => {
                distribution_from_counts(&count_exported(&last.export_root), mode)
            }
            _ => distribution_from_results(&self.store.list(), mode),
        }
    }

    pub fn get_value_stats(&self) -> ValueStats {
        value_stats(&self.store.list())
    }

    pub fn clear_results(&self) {
        self.store.clear();
        tracing::info!("Results cleared");
    }

    /// Check every execution provider against the configured model.
    pub async fn get_clip_accel_capabilities(&self) -> Result<AccelCapabilities> {
        let config = self.config();
        let options = config.engine_options(1);
        let factory = Arc::clone(&self.factory);
        let demoted = self.demoted.clone();
        let caps = tokio::task::spawn_blocking(move || {
            CapabilityDetector::new(factory.as_ref(), &options, &demoted).detect()
        })
        .await
        .map_err(|e| PipelineError::Embedding {
            message: format!("capability check failed: {e}"),
        })?;
        Ok(caps)
    }

    /// `onnx/*.onnx` under the model directory, relative and sorted.
    pub fn get_clip_model_files(&self) -> Result<Vec<String>> {
        list_model_files(&self.config().model_dir())
    }
}

async fn run_with_engine(
    mut ctx: JobContext,
    ticket: Arc<JobTicket>,
    factory: Arc<dyn SessionFactory>,
    cache: Arc<EngineCache>,
    demoted: DemotedProviders,
) {
    if ctx.config.uses_local_engine() {
        let options = ctx.config.engine_options.clone();
        match cached_engine(factory, options, &cache, demoted).await {
            Ok(engine) => ctx.engine = Some(engine),
            Err(e) => {
                tracing::error!(job_id = %ticket.job_id, error = %e, "CLIP engine unavailable");
                ticket.progress.fail();
                return;
            }
        }
    }
    run_job(ctx, ticket).await;
}

async fn cached_engine(
    factory: Arc<dyn SessionFactory>,
    options: EngineOptions,
    cache: &EngineCache,
    demoted: DemotedProviders,
) -> std::result::Result<Arc<ClipEngine>, JobError> {
    let mut cache = cache.lock().await;
    if let Some((key, engine)) = cache.as_ref() {
        if *key == options {
            tracing::debug!(provider = %engine.provider(), "Reusing CLIP engine");
            return Ok(Arc::clone(engine));
        }
        tracing::info!("Engine settings changed, rebuilding CLIP engine");
    }
    // Release the old sessions before loading new ones.
    *cache = None;

    let key = options.clone();
    let engine = tokio::task::spawn_blocking(move || {
        ClipEngine::build(factory.as_ref(), &options, &demoted)
    })
    .await
    .map_err(|e| {
        JobError::Engine(PipelineError::EngineExhausted {
            message: format!("engine build task failed: {e}"),
        })
    })?
    .map_err(JobError::Engine)?;

    let engine = Arc::new(engine);
    *cache = Some((key, Arc::clone(&engine)));
    Ok(engine)
}

fn list_model_files(model_dir: &Path) -> Result<Vec<String>> {
    let onnx_dir = model_dir.join("onnx");
    if !onnx_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<String> = std::fs::read_dir(&onnx_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| name.to_lowercase().ends_with(".onnx"))
        .map(|name| format!("onnx/{name}"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisEngine;
    use crate::embedding::mock::MockFactory;
    use crate::embedding::ProviderKind;
    use crate::error::ClipsortError;
    use crate::remote::mock::MockClassifier;
    use crate::types::{CategoryKey, JobStatus};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::time::Duration;

    fn write_images(dir: &Path, count: usize) {
        for i in 0..count {
            let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
                10,
                10,
                image::Rgb([(i * 40 % 256) as u8, 90, 200]),
            ));
            img.save_with_format(dir.join(format!("p{i}.png")), ImageFormat::Png)
                .unwrap();
        }
    }

    fn test_config(concurrency: usize) -> Config {
        let mut config = Config::default();
        config.processing.concurrency = concurrency;
        config.embedding.image_size = 16;
        config.accel.auto = true;
        config.accel.coreml = false;
        config
    }

    fn analyzer(config: Config, factory: &Arc<MockFactory>) -> Analyzer {
        Analyzer::new(config)
            .with_factory(factory.clone())
            .with_demoted(DemotedProviders::new())
    }

    struct Dirs {
        source: tempfile::TempDir,
        export: tempfile::TempDir,
    }

    fn dirs(images: usize) -> Dirs {
        let source = tempfile::tempdir().unwrap();
        write_images(source.path(), images);
        Dirs {
            source,
            export: tempfile::tempdir().unwrap(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_roots_rejected() {
        let factory = Arc::new(MockFactory::new());
        let analyzer = analyzer(test_config(1), &factory);
        let d = dirs(0);

        let err = analyzer
            .start_analysis(Path::new(""), d.export.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClipsortError::Job(JobError::InvalidRoot { role: "source", .. })
        ));
        let err = analyzer
            .start_analysis(Path::new("/nonexistent/clipsort/src"), d.export.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ClipsortError::Job(JobError::InvalidRoot { .. })));
        let err = analyzer.start_analysis(d.source.path(), Path::new("")).await.unwrap_err();
        assert!(matches!(
            err,
            ClipsortError::Job(JobError::InvalidRoot { role: "export", .. })
        ));
        assert!(analyzer.get_progress().is_none());
    }

    #[test]
    fn test_start_on_current_thread_runtime() {
        let factory = Arc::new(MockFactory::new());
        let analyzer = analyzer(test_config(1), &factory);
        let d = dirs(2);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let state = runtime.block_on(async {
            let job_id = analyzer
                .start_analysis(d.source.path(), d.export.path())
                .await
                .unwrap();
            analyzer.wait(&job_id).await.unwrap()
        });
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.processed, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_warmup_failure_falls_back_and_job_completes() {
        let factory = Arc::new(MockFactory::new().fail_warmup(ProviderKind::Cuda));
        let mut config = test_config(2);
        config.accel.cuda = true;
        let analyzer = analyzer(config, &factory);
        let d = dirs(4);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        let state = analyzer.wait(&job_id).await.unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!((state.processed, state.errors), (4, 0));
        assert!(factory.built().contains(&ProviderKind::Cpu));

        let caps = analyzer.get_clip_accel_capabilities().await.unwrap();
        let cuda = caps.get(ProviderKind::Cuda).unwrap();
        assert!(cuda.supported);
        assert!(!cuda.available);
        assert!(cuda.enabled);
        assert!(caps.get(ProviderKind::Cpu).unwrap().available);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_rejected_while_running() {
        let factory = Arc::new(MockFactory::new().with_delay(Duration::from_millis(30)));
        let analyzer = analyzer(test_config(1), &factory);
        let d = dirs(6);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        let err = analyzer
            .start_analysis(d.source.path(), d.export.path())
            .await
            .unwrap_err();
        match err {
            ClipsortError::Job(JobError::AlreadyRunning { job_id: running }) => {
                assert_eq!(running, job_id)
            }
            other => panic!("expected AlreadyRunning, got {other}"),
        }

        let state = analyzer.wait(&job_id).await.unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.processed, 6);

        // Slot is free once the job has ended.
        let next = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&next).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_cached_until_options_change() {
        let factory = Arc::new(MockFactory::new());
        let analyzer = analyzer(test_config(2), &factory);
        let d = dirs(2);

        let first = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&first).await.unwrap();
        let built = factory.built().len();
        assert_eq!(built, 2);

        let second = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&second).await.unwrap();
        assert_eq!(factory.built().len(), built);

        analyzer.set_config(test_config(3)).unwrap();
        let third = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&third).await.unwrap();
        assert_eq!(factory.built().len(), built + 3);
        assert_eq!(analyzer.list_photos().len(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_failure_ends_job_in_error() {
        let factory = Arc::new(MockFactory::new().fail_build(ProviderKind::Cpu));
        let mut config = test_config(1);
        config.accel.auto = false;
        let analyzer = analyzer(config, &factory);
        let d = dirs(3);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        let state = analyzer.wait(&job_id).await.unwrap();
        assert_eq!(state.status, JobStatus::Error);
        assert_eq!(state.errors, 1);
        assert_eq!(state.processed, 0);
        assert!(analyzer.list_photos().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_engine_builds_no_pool() {
        let factory = Arc::new(MockFactory::new());
        let mut config = test_config(2);
        config.analysis.engine = AnalysisEngine::Remote;
        let remote = Arc::new(MockClassifier::new(CategoryKey::CityStreetTravel));
        let analyzer = analyzer(config, &factory).with_remote(remote);
        let d = dirs(3);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        let state = analyzer.wait(&job_id).await.unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert!(factory.built().is_empty());

        let dist = analyzer.get_distribution(DistributionMode::CountRatio);
        assert_eq!(dist.by_category[&CategoryKey::CityStreetTravel], 1.0);
        assert_eq!(analyzer.get_value_stats().unknown, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_distribution_uses_export_tree_after_value_job() {
        let factory = Arc::new(MockFactory::new());
        let mut config = test_config(2);
        config.analysis.value_enabled = true;
        let analyzer = analyzer(config, &factory);
        let d = dirs(5);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&job_id).await.unwrap();

        let stats = analyzer.get_value_stats();
        assert_eq!(stats.valuable + stats.not_valuable, 5);

        let dist = analyzer.get_distribution(DistributionMode::AvgScore);
        let total: f32 = dist.by_category.values().sum();
        assert!((total - 1.0).abs() < 1e-3);

        // Removing exported files changes the distribution, not the store.
        std::fs::remove_dir_all(d.export.path().join("valuable")).ok();
        std::fs::remove_dir_all(d.export.path().join("not_valuable")).ok();
        let dist = analyzer.get_distribution(DistributionMode::CountRatio);
        assert!(dist.by_category.values().all(|v| *v == 0.0));
        assert_eq!(analyzer.list_photos().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_photo_detail_and_clear() {
        let factory = Arc::new(MockFactory::new());
        let analyzer = analyzer(test_config(1), &factory);
        let d = dirs(1);

        let job_id = analyzer.start_analysis(d.source.path(), d.export.path()).await.unwrap();
        analyzer.wait(&job_id).await.unwrap();

        let photo = analyzer.list_photos().pop().unwrap();
        let detail = analyzer.get_photo_detail(&photo.id).unwrap();
        assert_eq!(detail.result.id, photo.id);
        assert!(detail.analysis_log.contains("engine: clip"));
        assert!(detail.analysis_log.contains("provider: CPU"));

        assert!(matches!(
            analyzer.get_photo_detail("missing"),
            Err(ClipsortError::Job(JobError::NotFound(_)))
        ));

        analyzer.clear_results();
        assert!(analyzer.list_photos().is_empty());
    }

    #[test]
    fn test_list_model_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_model_files(dir.path()).unwrap().is_empty());

        let onnx = dir.path().join("onnx");
        std::fs::create_dir_all(&onnx).unwrap();
        for name in ["model_q4f16.onnx", "model.onnx", "model_fp16.ONNX", "notes.txt"] {
            std::fs::write(onnx.join(name), b"x").unwrap();
        }
        std::fs::create_dir_all(onnx.join("sub.onnx")).unwrap();

        assert_eq!(
            list_model_files(dir.path()).unwrap(),
            vec![
                "onnx/model.onnx".to_string(),
                "onnx/model_fp16.ONNX".to_string(),
                "onnx/model_q4f16.onnx".to_string(),
            ]
        );
    }

    #[test]
    fn test_set_config_validates() {
        let analyzer = Analyzer::new(Config::default()).with_demoted(DemotedProviders::new());
        let mut bad = Config::default();
        bad.remote.timeout_ms = 0;
        assert!(analyzer.set_config(bad).is_err());
        assert_eq!(analyzer.config().remote.timeout_ms, Config::default().remote.timeout_ms);
    }
}
