//! isis-ingest - build search collections from JSON-lines dumps

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use isis_common::logging::{init_logging, LogConfig, LogLevel};
use isis_ingest::progress::{BackendProgressStore, FileProgressStore, ProgressStore};
use isis_ingest::stats::{LogReporter, ProgressReporter, ProgressSnapshot};
use isis_ingest::{
    BackendConfig, DataCiteExtractor, ElasticsearchBackend, IndexBuilder, IngestConfig,
    SearchBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "isis-ingest")]
#[command(author, version, about = "Build CDS/ISIS-style search collections from JSON-lines files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest files matching a glob pattern into a collection
    Build(BuildArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Glob pattern of source files, e.g. "dumps/**/*.jsonl"
    pattern: String,

    /// Target collection
    #[arg(short, long)]
    collection: String,

    /// Records per bulk request
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent bulk requests
    #[arg(long)]
    workers: Option<usize>,

    /// Stop after this many records
    #[arg(long)]
    limit: Option<u64>,

    /// Re-read files completed by earlier runs
    #[arg(long)]
    no_resume: bool,

    /// Submit one batch at a time, in file order
    #[arg(long)]
    sequential: bool,

    /// Records between progress lines (0 disables them)
    #[arg(long)]
    progress_interval: Option<u64>,

    /// Completed files between progress checkpoints
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Count extractor rejections as errors
    #[arg(long)]
    count_rejected: bool,

    /// Keep progress as JSON files here instead of in the backend
    #[arg(long)]
    progress_dir: Option<PathBuf>,
}

impl BuildArgs {
    fn apply(&self, mut config: IngestConfig) -> IngestConfig {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(interval) = self.progress_interval {
            config.progress_interval = interval;
        }
        if let Some(interval) = self.checkpoint_interval {
            config.checkpoint_interval = interval;
        }
        if self.limit.is_some() {
            config.limit = self.limit;
        }
        if self.no_resume {
            config.resume = false;
        }
        if self.sequential {
            config.parallel = false;
        }
        if self.count_rejected {
            config.count_rejected_as_errors = true;
        }
        config
    }
}

/// Spinner whose message follows the latest progress snapshot
struct SpinnerReporter {
    bar: ProgressBar,
}

impl SpinnerReporter {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid spinner template")?,
        );
        bar.set_message("Starting...");
        bar.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { bar })
    }
}

impl ProgressReporter for SpinnerReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_message(snapshot.to_string());
        self.bar.suspend(|| LogReporter.report(snapshot));
    }
}

async fn build(args: BuildArgs) -> Result<()> {
    let config = args
        .apply(IngestConfig::from_env().context("Invalid ingest configuration")?);
    let backend_config = BackendConfig::from_env().context("Invalid backend configuration")?;
    let meta_collection = backend_config.meta_collection.clone();

    let backend: Arc<dyn SearchBackend> = Arc::new(
        ElasticsearchBackend::new(backend_config).context("Failed to create backend client")?,
    );

    let store: Arc<dyn ProgressStore> = match args.progress_dir {
        Some(ref dir) => Arc::new(FileProgressStore::new(dir)),
        None => Arc::new(
            BackendProgressStore::open(backend.clone(), &meta_collection)
                .await
                .context("Failed to open progress store")?,
        ),
    };

    let spinner = Arc::new(SpinnerReporter::new()?);
    let mut builder = IndexBuilder::new(&args.collection, backend, store, config)
        .await
        .with_context(|| format!("Failed to prepare collection '{}'", args.collection))?
        .with_reporter(spinner.clone());

    let result = builder
        .add_jsonl_files(&args.pattern, Arc::new(DataCiteExtractor))
        .await;
    spinner.bar.finish_and_clear();

    let stats = result.with_context(|| format!("Build of '{}' failed", args.collection))?;
    info!(
        collection = %args.collection,
        records = stats.total_records,
        errors = stats.total_errors,
        "Done"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("isis-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    match cli.command {
        Command::Build(args) => build(args).await,
    }
}
