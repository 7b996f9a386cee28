use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use image::ImageFormat;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use portrait_isolation::{IsolationConfig, IsolationEngine};
use rayon::{prelude::*, ThreadPoolBuilder};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short, long, global = true,
        default_value_t = thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    )]
    num_threads: usize,

    #[command(flatten)]
    isolation: IsolationConfig,
}

#[derive(Subcommand)]
enum Command {
    /// Print a quality analysis for every image under a directory
    Analyze { input_dir: PathBuf },
    /// Isolate the subject of every image under a directory
    Isolate { input_dir: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let input_dir = match &cli.command {
        Command::Analyze { input_dir } | Command::Isolate { input_dir } => input_dir,
    };
    ensure!(input_dir.is_dir(), "Input directory does not exist");
    for model_path in [
        &cli.isolation.detection_model_path,
        &cli.isolation.segmentation_model_path,
    ]
    .into_iter()
    .flatten()
    {
        ensure!(
            model_path.exists(),
            "Model path does not exist: {}",
            model_path.display()
        );
    }

    ThreadPoolBuilder::new()
        .num_threads(cli.num_threads)
        .build_global()?;

    let engine = IsolationEngine::from_config(cli.isolation.clone())
        .context("Failed to set up the isolation engine")?;

    let image_paths = collect_images(input_dir);
    info!(count = image_paths.len(), dir = %input_dir.display(), "collected images");

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    match &cli.command {
        Command::Analyze { .. } => {
            let analyzer = engine.analyzer();
            image_paths
                .par_iter()
                .progress_with(progress_bar.clone())
                .try_for_each(|path| {
                    let analysis = analyzer.analyze(path);
                    emit(&json!({ "path": path, "analysis": analysis }))
                })?;
        }
        Command::Isolate { .. } => {
            image_paths
                .par_iter()
                .progress_with(progress_bar.clone())
                .try_for_each(|path| match engine.isolate_person(path) {
                    Ok(result) => emit(&json!({ "path": path, "result": result })),
                    Err(e) => emit(&json!({ "path": path, "error": e.to_string() })),
                })?;
        }
    }

    progress_bar.finish();
    engine.shutdown();

    Ok(())
}

fn collect_images(input_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(input_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| ImageFormat::from_path(e.path()).is_ok())
        .map(|e| e.into_path())
        .collect()
}

/// One JSON document per line on stdout.
fn emit(line: &serde_json::Value) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line).context("Failed to write result")
}
