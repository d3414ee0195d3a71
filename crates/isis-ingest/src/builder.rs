//! Index builder
//!
//! Ties discovery, the action stream, the submitter and the progress store
//! together for one target collection.
//!
//! ```no_run
//! use isis_ingest::backend::MemoryBackend;
//! use isis_ingest::progress::FileProgressStore;
//! use isis_ingest::record::DataCiteExtractor;
//! use isis_ingest::{IndexBuilder, IngestConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> isis_common::Result<()> {
//! let mut builder = IndexBuilder::new(
//!     "datacite",
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(FileProgressStore::new(".isis-progress")),
//!     IngestConfig::default(),
//! )
//! .await?;
//!
//! let stats = builder
//!     .add_jsonl_files("dumps/**/*.jsonl", Arc::new(DataCiteExtractor))
//!     .await?;
//! println!("{}", stats);
//! # Ok(())
//! # }
//! ```

use isis_common::{IsisError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::backend::{record_mappings, SearchBackend};
use crate::config::IngestConfig;
use crate::discovery::discover_files;
use crate::progress::ProgressStore;
use crate::record::{Record, RecordExtractor};
use crate::stats::{Counters, LogReporter, ProgressReporter, RunStats};
use crate::stream::{ActionSource, JsonlActionStream, RecordActionStream};
use crate::submitter::{BatchSubmitter, SubmitMode, SubmitSummary};

pub struct IndexBuilder {
    collection: String,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn ProgressStore>,
    config: IngestConfig,
    processed: BTreeSet<String>,
    reporter: Arc<dyn ProgressReporter>,
}

impl IndexBuilder {
    /// Provision `collection` and load its saved progress
    pub async fn new(
        collection: &str,
        backend: Arc<dyn SearchBackend>,
        store: Arc<dyn ProgressStore>,
        config: IngestConfig,
    ) -> Result<Self> {
        if collection.trim().is_empty() {
            return Err(IsisError::config("collection name cannot be empty"));
        }
        config.validate()?;

        backend
            .ensure_collection(collection, &record_mappings())
            .await?;
        let processed = store.load(collection).await;

        info!(
            collection,
            completed_files = processed.len(),
            batch_size = config.batch_size,
            "Index builder ready"
        );

        Ok(Self {
            collection: collection.to_string(),
            backend,
            store,
            config,
            processed,
            reporter: Arc::new(LogReporter),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Files recorded as fully read, including earlier runs
    pub fn processed_files(&self) -> &BTreeSet<String> {
        &self.processed
    }

    /// Ingest every JSON-lines file matching `pattern`
    ///
    /// Progress is saved and the collection refreshed only when the run
    /// completes; on a fatal error the last checkpoint is what survives.
    pub async fn add_jsonl_files(
        &mut self,
        pattern: &str,
        extractor: Arc<dyn RecordExtractor>,
    ) -> Result<RunStats> {
        let started = Instant::now();

        let files = discover_files(pattern)?;
        if files.is_empty() {
            warn!(pattern, "No files match pattern");
        } else {
            info!(pattern, files = files.len(), "Discovered source files");
        }

        let mut stream = JsonlActionStream::new(
            &self.collection,
            files,
            extractor,
            self.store.clone(),
            self.processed.clone(),
            &self.config,
        )
        .with_reporter(self.reporter.clone());

        let result = self.submitter().run(&mut stream).await;
        let counters = stream.counters();
        let files_skipped = stream.files_skipped();
        self.processed = stream.into_processed();

        let summary = self.finish(result, counters)?;
        self.store.save(&self.collection, &self.processed).await?;
        self.backend.refresh(&self.collection).await?;

        let stats = RunStats {
            files_processed: self.processed.len(),
            files_skipped,
            ..run_stats(counters, summary, started)
        };
        self.log_summary(&stats);
        Ok(stats)
    }

    /// Ingest records from memory, without file bookkeeping
    ///
    /// `total_hint` adds a completion percentage to progress lines.
    pub async fn add_records<I>(&mut self, records: I, total_hint: Option<u64>) -> Result<RunStats>
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: Send,
    {
        let started = Instant::now();

        let mut stream =
            RecordActionStream::new(&self.collection, records.into_iter(), total_hint, &self.config)
                .with_reporter(self.reporter.clone());

        let result = self.submitter().run(&mut stream).await;
        let counters = stream.counters();

        let summary = self.finish(result, counters)?;
        self.backend.refresh(&self.collection).await?;

        let stats = run_stats(counters, summary, started);
        self.log_summary(&stats);
        Ok(stats)
    }

    fn submitter(&self) -> BatchSubmitter<'_> {
        BatchSubmitter::new(
            self.backend.as_ref(),
            self.config.batch_size,
            SubmitMode::from_config(&self.config),
        )
    }

    /// Report what was done before a fatal error, then pass it on
    fn finish(&self, result: Result<SubmitSummary>, counters: Counters) -> Result<SubmitSummary> {
        result.map_err(|e| {
            error!(
                collection = %self.collection,
                records = counters.records,
                errors = counters.errors,
                rejected = counters.rejected,
                files_processed = self.processed.len(),
                error = %e,
                "Build aborted"
            );
            e
        })
    }

    fn log_summary(&self, stats: &RunStats) {
        info!(collection = %self.collection, "Build complete");
        for line in stats.to_string().lines() {
            info!("  {}", line);
        }
    }
}

fn run_stats(counters: Counters, summary: SubmitSummary, started: Instant) -> RunStats {
    RunStats {
        total_records: counters.records,
        total_errors: counters.errors + summary.failed_items,
        total_rejected: counters.rejected,
        failed_items: summary.failed_items,
        batches_submitted: summary.batches,
        files_processed: 0,
        files_skipped: 0,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    }
}
