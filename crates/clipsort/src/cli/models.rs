//! The `clipsort models` command for inspecting installed model files.

use clap::{Args, Subcommand};
use clipsort_core::{Analyzer, Config};

/// Arguments for the `models` command.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub command: ModelsCommand,
}

/// Subcommands for model inspection.
#[derive(Subcommand, Debug)]
pub enum ModelsCommand {
    /// List ONNX files under the model directory
    List,

    /// Show model directory path
    Path,
}

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Execute the models command.
pub async fn execute(args: ModelsArgs, config: Config) -> anyhow::Result<()> {
    match args.command {
        ModelsCommand::List => {
            let model_dir = config.model_dir();
            let selected = config.embedding.model_file.clone();
            let files = Analyzer::new(config).get_clip_model_files()?;

            println!("Model directory: {}", model_dir.display());
            if files.is_empty() {
                println!("  No ONNX files found under onnx/");
            }
            for line in listing(&files, &selected) {
                println!("{line}");
            }
            let tokenizer = if model_dir.join(TOKENIZER_FILE).exists() {
                "present"
            } else {
                "missing"
            };
            println!("  {TOKENIZER_FILE}: {tokenizer}");
        }

        ModelsCommand::Path => {
            println!("{}", config.model_dir().display());
        }
    }

    Ok(())
}

/// One line per model file, the configured one marked with `*`.
fn listing(files: &[String], selected: &str) -> Vec<String> {
    files
        .iter()
        .map(|file| {
            let mark = if file == selected { '*' } else { ' ' };
            format!("  {mark} {file}")
        })
        .collect()
}
