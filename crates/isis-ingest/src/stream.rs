//! Action stream generation
//!
//! An [`ActionSource`] lazily produces write operations in batches. The
//! submitter pulls from it, so a source never reads further ahead than the
//! batch currently being filled.
//!
//! [`JsonlActionStream`] reads JSON-lines files in order and owns the
//! processed-file set for the run. A file is recorded once every line has
//! been read and the backend has answered every batch carrying its records.
//! The set is checkpointed to the [`ProgressStore`] every
//! `checkpoint_interval` recorded files.

use async_trait::async_trait;
use isis_common::Result;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::progress::ProgressStore;
use crate::record::{Record, RecordExtractor, WriteOperation};
use crate::stats::{Counters, LogReporter, ProgressReporter, ProgressSnapshot};

/// Pull-based producer of write operations
#[async_trait]
pub trait ActionSource: Send {
    /// Up to `max` further operations; an empty batch means the source is done
    ///
    /// Non-empty batches are numbered from 0 in the order they are returned.
    /// Errors are fatal for the run. Bad lines and unreadable files are
    /// absorbed into [`ActionSource::counters`] instead.
    async fn next_batch(&mut self, max: usize) -> Result<Vec<WriteOperation>>;

    /// The backend has answered every batch numbered below `written`
    ///
    /// Called before each pull and once more when submission stops.
    /// `written` never decreases between calls.
    async fn acknowledge(&mut self, _written: u64) {}

    fn counters(&self) -> Counters;
}

/// Emits a progress snapshot every `interval` records
struct ProgressTicker {
    reporter: Arc<dyn ProgressReporter>,
    interval: u64,
    started: Instant,
}

impl ProgressTicker {
    fn new(interval: u64) -> Self {
        Self {
            reporter: Arc::new(LogReporter),
            interval,
            started: Instant::now(),
        }
    }

    fn due(&self, records: u64) -> bool {
        self.interval > 0 && records % self.interval == 0
    }

    fn snapshot(&self, counters: Counters) -> ProgressSnapshot {
        ProgressSnapshot {
            records: counters.records,
            errors: counters.errors,
            rejected: counters.rejected,
            elapsed: self.started.elapsed(),
            file_index: 0,
            file_count: 0,
            current_file: None,
            total_hint: None,
        }
    }
}

struct OpenFile {
    path: String,
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    /// Number of the last batch holding one of this file's records
    last_batch: Option<u64>,
}

/// Action stream over JSON-lines files
pub struct JsonlActionStream {
    collection: String,
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<OpenFile>,
    line: Vec<u8>,
    extractor: Arc<dyn RecordExtractor>,
    store: Arc<dyn ProgressStore>,
    processed: BTreeSet<String>,
    /// Fully read files and the last batch carrying their records
    unwritten: VecDeque<(u64, String)>,
    batches: u64,
    files_skipped: usize,
    counters: Counters,
    ticker: ProgressTicker,
    resume: bool,
    limit: Option<u64>,
    checkpoint_interval: usize,
    count_rejected_as_errors: bool,
    finished: bool,
}

impl JsonlActionStream {
    /// `processed` seeds the resume set, normally from [`ProgressStore::load`]
    pub fn new(
        collection: &str,
        files: Vec<PathBuf>,
        extractor: Arc<dyn RecordExtractor>,
        store: Arc<dyn ProgressStore>,
        processed: BTreeSet<String>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            files,
            next_file: 0,
            current: None,
            line: Vec::new(),
            extractor,
            store,
            processed,
            unwritten: VecDeque::new(),
            batches: 0,
            files_skipped: 0,
            counters: Counters::default(),
            ticker: ProgressTicker::new(config.progress_interval),
            resume: config.resume,
            limit: config.limit,
            checkpoint_interval: config.checkpoint_interval.max(1),
            count_rejected_as_errors: config.count_rejected_as_errors,
            finished: false,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.ticker.reporter = reporter;
        self
    }

    /// Files read to the end whose records the backend has answered for
    pub fn processed_files(&self) -> &BTreeSet<String> {
        &self.processed
    }

    pub fn into_processed(self) -> BTreeSet<String> {
        self.processed
    }

    /// Files passed over because an earlier run completed them
    pub fn files_skipped(&self) -> usize {
        self.files_skipped
    }

    fn limit_reached(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.counters.records >= limit)
    }

    /// Open the next file that still needs reading, `false` when none is left
    async fn open_next(&mut self) -> bool {
        while self.next_file < self.files.len() {
            let path = &self.files[self.next_file];
            self.next_file += 1;
            let key = path.to_string_lossy().into_owned();

            if self.resume && self.processed.contains(&key) {
                debug!(path = %key, "Skipping completed file");
                self.files_skipped += 1;
                continue;
            }

            match File::open(path).await {
                Ok(file) => {
                    debug!(
                        path = %key,
                        file = self.next_file,
                        of = self.files.len(),
                        "Reading file"
                    );
                    self.start_reading(key, BufReader::new(file));
                    return true;
                },
                Err(e) => {
                    self.counters.errors += 1;
                    warn!(path = %key, error = %e, "Cannot open file, leaving it for a later run");
                },
            }
        }
        false
    }

    fn start_reading(&mut self, path: String, reader: impl AsyncBufRead + Send + Unpin + 'static) {
        self.current = Some(OpenFile {
            path,
            reader: Box::new(reader),
            last_batch: None,
        });
    }

    /// Every line of `file` has been read
    async fn file_read(&mut self, file: OpenFile) {
        match file.last_batch {
            Some(batch) => {
                debug!(path = %file.path, batch, "File read, waiting for its last batch");
                self.unwritten.push_back((batch, file.path));
            },
            None => self.mark_processed(file.path).await,
        }
    }

    async fn mark_processed(&mut self, path: String) {
        debug!(path = %path, "File complete");

        if !self.processed.insert(path) || self.processed.len() % self.checkpoint_interval != 0 {
            return;
        }

        // A missed checkpoint is covered by the end-of-run save
        match self.store.save(&self.collection, &self.processed).await {
            Ok(()) => info!(
                collection = %self.collection,
                files = self.processed.len(),
                "Checkpointed build progress"
            ),
            Err(e) => warn!(collection = %self.collection, error = %e, "Checkpoint failed"),
        }
    }

    fn reject(&mut self) {
        self.counters.rejected += 1;
        if self.count_rejected_as_errors {
            self.counters.errors += 1;
        }
    }

    fn report(&self) {
        let mut snapshot = self.ticker.snapshot(self.counters);
        snapshot.file_index = self.next_file;
        snapshot.file_count = self.files.len();
        snapshot.current_file = self.current.as_ref().map(|f| f.path.clone());
        self.ticker.reporter.report(&snapshot);
    }
}

#[async_trait]
impl ActionSource for JsonlActionStream {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<WriteOperation>> {
        let mut batch = Vec::with_capacity(max.min(1024));

        while batch.len() < max && !self.finished {
            if self.limit_reached() {
                self.finished = true;
                break;
            }

            let Some(file) = self.current.as_mut() else {
                if !self.open_next().await {
                    self.finished = true;
                }
                continue;
            };

            self.line.clear();
            match file.reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => {
                    if let Some(done) = self.current.take() {
                        self.file_read(done).await;
                    }
                },
                Ok(_) => {
                    let text = self.line.trim_ascii();
                    if text.is_empty() {
                        continue;
                    }

                    let raw: Value = match serde_json::from_slice(text) {
                        Ok(raw) => raw,
                        Err(e) => {
                            self.counters.errors += 1;
                            debug!(path = %file.path, error = %e, "Skipping malformed line");
                            continue;
                        },
                    };

                    match self.extractor.extract(&raw) {
                        Some(record) if !record.id.is_empty() => {
                            self.counters.records += 1;
                            batch.push(WriteOperation::upsert(&self.collection, record));
                            file.last_batch = Some(self.batches);

                            if self.ticker.due(self.counters.records) {
                                self.report();
                            }
                            if self.limit_reached() {
                                info!(records = self.counters.records, "Record limit reached");
                                self.current = None;
                                self.finished = true;
                            }
                        },
                        _ => self.reject(),
                    }
                },
                Err(e) => {
                    self.counters.errors += 1;
                    warn!(
                        path = %file.path,
                        error = %e,
                        "Read failed, abandoning file for a later run"
                    );
                    self.current = None;
                },
            }
        }

        if !batch.is_empty() {
            self.batches += 1;
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, written: u64) {
        while self
            .unwritten
            .front()
            .is_some_and(|(batch, _)| *batch < written)
        {
            if let Some((_, path)) = self.unwritten.pop_front() {
                self.mark_processed(path).await;
            }
        }
    }

    fn counters(&self) -> Counters {
        self.counters
    }
}

/// Action stream over in-memory records
///
/// No file bookkeeping and no resume. Records with an empty id are rejected.
pub struct RecordActionStream<I> {
    collection: String,
    records: I,
    counters: Counters,
    ticker: ProgressTicker,
    limit: Option<u64>,
    total_hint: Option<u64>,
    count_rejected_as_errors: bool,
}

impl<I> RecordActionStream<I>
where
    I: Iterator<Item = Record> + Send,
{
    pub fn new(
        collection: &str,
        records: I,
        total_hint: Option<u64>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            records,
            counters: Counters::default(),
            ticker: ProgressTicker::new(config.progress_interval),
            limit: config.limit,
            total_hint,
            count_rejected_as_errors: config.count_rejected_as_errors,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.ticker.reporter = reporter;
        self
    }
}

#[async_trait]
impl<I> ActionSource for RecordActionStream<I>
where
    I: Iterator<Item = Record> + Send,
{
    async fn next_batch(&mut self, max: usize) -> Result<Vec<WriteOperation>> {
        let mut batch = Vec::with_capacity(max.min(1024));

        while batch.len() < max {
            if self
                .limit
                .is_some_and(|limit| self.counters.records >= limit)
            {
                break;
            }

            let Some(record) = self.records.next() else {
                break;
            };

            if record.id.is_empty() {
                self.counters.rejected += 1;
                if self.count_rejected_as_errors {
                    self.counters.errors += 1;
                }
                continue;
            }

            self.counters.records += 1;
            batch.push(WriteOperation::upsert(&self.collection, record));

            if self.ticker.due(self.counters.records) {
                let mut snapshot = self.ticker.snapshot(self.counters);
                snapshot.total_hint = self.total_hint;
                self.ticker.reporter.report(&snapshot);
            }
        }

        Ok(batch)
    }

    fn counters(&self) -> Counters {
        self.counters
    }
}
