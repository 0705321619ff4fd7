//! clipsort CLI - sort photo folders into categories with a local CLIP model.
//!
//! Images are scored against fixed category prompts on an ONNX session pool
//! (or by a remote vision model) and copied into an export tree grouped by
//! category.
//!
//! # Usage
//!
//! ```bash
//! # Classify a folder
//! clipsort analyze ./photos ./sorted
//!
//! # Split each category into valuable / not_valuable, write JSON Lines
//! clipsort analyze ./photos ./sorted --value --format jsonl -o results.jsonl
//!
//! # Which execution providers work here
//! clipsort accel
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// clipsort - CLIP photo classification into category folders.
#[derive(Parser, Debug)]
#[command(name = "clipsort")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a folder of images and export them by category
    Analyze(cli::analyze::AnalyzeArgs),

    /// Report which execution providers are supported and working
    Accel,

    /// Inspect installed model files
    Models(cli::models::ModelsArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't up yet, so config warnings go straight to stderr.
    let config = match clipsort_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `clipsort config path`."
            );
            clipsort_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("clipsort v{}", clipsort_core::VERSION);

    match cli.command {
        Commands::Analyze(args) => cli::analyze::execute(args, config).await,
        Commands::Accel => cli::accel::execute(config).await,
        Commands::Models(args) => cli::models::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args).await,
    }
}
