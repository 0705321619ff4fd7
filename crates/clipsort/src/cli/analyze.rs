//! The `clipsort analyze` command.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, ValueEnum};
use clipsort_core::{
    AnalysisEngine, Analyzer, CategoryKey, Config, Distribution, DistributionMode, JobConfig,
    JobState, JobStatus, JobSummary, OutputFormat, OutputWriter, StreamChunk, ValueStats,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

/// Arguments for the `analyze` command.
#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Folder of images to classify
    #[arg(required = true)]
    pub source: String,

    /// Folder to copy classified images into
    #[arg(required = true)]
    pub export: String,

    /// Number of parallel workers (and pooled sessions)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Split each category into valuable / not_valuable
    #[arg(long)]
    pub value: bool,

    /// Classification engine
    #[arg(long, value_enum)]
    pub engine: Option<EngineArg>,

    /// Retry items that fail locally on the remote model
    #[arg(long)]
    pub fallback_remote: bool,

    /// ONNX file relative to the model directory
    #[arg(long)]
    pub model_file: Option<String>,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    pub format: FormatArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EngineArg {
    Clip,
    Remote,
}

impl From<EngineArg> for AnalysisEngine {
    fn from(engine: EngineArg) -> Self {
        match engine {
            EngineArg::Clip => AnalysisEngine::Clip,
            EngineArg::Remote => AnalysisEngine::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Json,
    Jsonl,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Jsonl => OutputFormat::JsonLines,
        }
    }
}

/// Execute the analyze command.
pub async fn execute(args: AnalyzeArgs, config: Config) -> anyhow::Result<()> {
    let config = apply_overrides(config, &args);
    config.validate()?;
    let streaming = JobConfig::from_config(&config).stream;

    let source = super::expand_path(&args.source);
    let export = super::expand_path(&args.export);

    let analyzer = Analyzer::new(config);
    let mut progress = analyzer.subscribe_progress();
    let stream = analyzer.subscribe_stream();

    let start = Instant::now();
    let job_id = analyzer.start_analysis(&source, &export).await?;
    tracing::info!(%job_id, source = %source.display(), export = %export.display(), "Analysis started");

    let bar = create_progress_bar();
    let printer = streaming.then(|| tokio::spawn(print_stream(stream, bar.clone())));

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            event = progress.recv() => match event {
                Ok(state) if state.job_id == job_id => {
                    update_bar(&bar, &state, start);
                    if state.status.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress subscriber lagged");
                    if let Some(state) = analyzer.get_progress() {
                        update_bar(&bar, &state, start);
                        if state.status.is_terminal() {
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                analyzer.cancel_analysis(&job_id);
                bar.set_message("canceling...");
                tracing::warn!("Cancel requested, finishing in-flight items");
            }
        }
    }

    let final_state = analyzer.wait(&job_id).await;
    bar.finish_and_clear();
    if let Some(printer) = printer {
        printer.abort();
    }

    let results = analyzer.list_photos();
    let summary = JobSummary {
        job: final_state.clone(),
        distribution: analyzer.get_distribution(DistributionMode::CountRatio),
        value_stats: analyzer.get_value_stats(),
    };

    let format = OutputFormat::from(args.format);
    match &args.output {
        Some(path) => {
            let file = File::create(path)?;
            let mut writer = OutputWriter::new(BufWriter::new(file), format, true);
            writer.write_report(&results, &summary)?;
            writer.flush()?;
            tracing::info!("Wrote {} results to {}", writer.results_written(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = OutputWriter::new(stdout.lock(), format, true);
            writer.write_report(&results, &summary)?;
            writer.flush()?;
        }
    }

    print_summary(final_state.as_ref(), &summary.distribution, &summary.value_stats, start);

    match final_state.map(|s| s.status) {
        Some(JobStatus::Error) => anyhow::bail!("analysis failed, see the log for details"),
        Some(JobStatus::Canceled) => {
            tracing::warn!("Analysis canceled before all images were processed");
            Ok(())
        }
        _ => Ok(()),
    }
}

fn apply_overrides(mut config: Config, args: &AnalyzeArgs) -> Config {
    if let Some(concurrency) = args.concurrency {
        config.processing.concurrency = concurrency;
    }
    if args.value {
        config.analysis.value_enabled = true;
    }
    if let Some(engine) = args.engine {
        config.analysis.engine = engine.into();
    }
    if args.fallback_remote {
        config.analysis.fallback_to_remote = true;
    }
    if let Some(model_file) = &args.model_file {
        config.embedding.model_file = model_file.clone();
    }
    config
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    pb.set_message("starting...");
    pb
}

fn update_bar(bar: &ProgressBar, state: &JobState, start: Instant) {
    bar.set_length(state.total as u64);
    bar.set_position(state.processed as u64);

    let elapsed = start.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        state.processed as f64 / elapsed
    } else {
        0.0
    };
    let mut message = format!("{rate:.1} img/sec");
    if state.errors > 0 {
        message.push_str(&format!(", {} failed", state.errors));
    }
    if let Some(file) = &state.current_file {
        message.push_str(&format!(" {file}"));
    }
    bar.set_message(message);
}

/// Echo live remote output to stderr above the progress bar.
async fn print_stream(mut rx: Receiver<StreamChunk>, bar: ProgressBar) {
    loop {
        match rx.recv().await {
            Ok(chunk) => bar.suspend(|| {
                let mut stderr = std::io::stderr().lock();
                if chunk.reset {
                    let _ = writeln!(stderr, "\n[{}]", chunk.file_name);
                }
                let _ = write!(stderr, "{}", chunk.delta);
                if chunk.done {
                    let _ = writeln!(stderr);
                }
                let _ = stderr.flush();
            }),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(
    state: Option<&JobState>,
    distribution: &Distribution,
    value_stats: &ValueStats,
    start: Instant,
) {
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!();
    if let Some(state) = state {
        eprintln!(
            "  Job {}: {} of {} processed, {} failed in {:.1}s",
            state.status, state.processed, state.total, state.errors, elapsed
        );
    }
    eprintln!("  Distribution (share of images):");
    for key in CategoryKey::ALL {
        let share = distribution.by_category.get(&key).copied().unwrap_or(0.0);
        eprintln!("    {:<20} {:>6.1}%", key.as_str(), share * 100.0);
    }
    if value_stats.valuable + value_stats.not_valuable > 0 {
        eprintln!(
            "  Value: {} valuable, {} not valuable, {} unjudged",
            value_stats.valuable, value_stats.not_valuable, value_stats.unknown
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: AnalyzeArgs,
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = TestCli::parse_from([
            "clipsort",
            "./in",
            "./out",
            "--concurrency",
            "3",
            "--value",
            "--engine",
            "remote",
            "--fallback-remote",
            "--model-file",
            "onnx/model.onnx",
            "--format",
            "jsonl",
        ]);
        let config = apply_overrides(Config::default(), &cli.args);
        assert_eq!(config.processing.concurrency, 3);
        assert!(config.analysis.value_enabled);
        assert_eq!(config.analysis.engine, AnalysisEngine::Remote);
        assert!(config.analysis.fallback_to_remote);
        assert_eq!(config.embedding.model_file, "onnx/model.onnx");
        assert_eq!(OutputFormat::from(cli.args.format), OutputFormat::JsonLines);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = TestCli::parse_from(["clipsort", "./in", "./out"]);
        let base = Config::default();
        let config = apply_overrides(base.clone(), &cli.args);
        assert_eq!(config.processing.concurrency, base.processing.concurrency);
        assert_eq!(config.analysis.engine, AnalysisEngine::Clip);
        assert!(!config.analysis.value_enabled);
    }
}
