//! Batch submission
//!
//! Pulls fixed-size batches from an [`ActionSource`] and sends each one as a
//! single bulk request. In concurrent mode up to `workers` requests are in
//! flight at once; the source is still polled from one place, so production
//! stays single-threaded and only ever runs `workers` batches ahead.
//!
//! Before each pull the source is told how many leading batches the backend
//! has answered, so it can record files whose records are all written.

use futures::stream::{self, StreamExt};
use isis_common::Result;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BulkOutcome, SearchBackend};
use crate::config::IngestConfig;
use crate::record::WriteOperation;
use crate::stream::ActionSource;

/// How many failed items of one batch are logged individually
const LOGGED_FAILURES_PER_BATCH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// One batch in flight, backend writes in stream order
    Sequential,
    /// Up to `workers` batches in flight, completion order unspecified
    Concurrent { workers: usize },
}

impl SubmitMode {
    pub fn from_config(config: &IngestConfig) -> Self {
        if config.parallel && config.workers > 1 {
            SubmitMode::Concurrent {
                workers: config.workers,
            }
        } else {
            SubmitMode::Sequential
        }
    }

    fn in_flight(self) -> usize {
        match self {
            SubmitMode::Sequential => 1,
            SubmitMode::Concurrent { workers } => workers.max(1),
        }
    }
}

/// Totals over every batch the backend answered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    pub batches: u64,
    pub items: u64,
    pub succeeded: u64,
    pub failed_items: u64,
}

impl SubmitSummary {
    fn absorb(&mut self, outcome: &BulkOutcome) {
        self.batches += 1;
        self.items += outcome.items.len() as u64;
        self.succeeded += outcome.succeeded() as u64;
        self.failed_items += outcome.failed() as u64;
    }
}

/// Low-water mark over answered batch numbers
#[derive(Debug, Default)]
struct Written {
    answered: BTreeSet<u64>,
    /// Every batch below this number has been answered
    below: u64,
}

impl Written {
    fn answer(&mut self, batch: u64) {
        self.answered.insert(batch);
        while self.answered.remove(&self.below) {
            self.below += 1;
        }
    }
}

#[derive(Debug, Default)]
struct WriteTracker(Mutex<Written>);

impl WriteTracker {
    fn answer(&self, batch: u64) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .answer(batch);
    }

    fn written(&self) -> u64 {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .below
    }
}

pub struct BatchSubmitter<'a> {
    backend: &'a dyn SearchBackend,
    batch_size: usize,
    mode: SubmitMode,
}

impl<'a> BatchSubmitter<'a> {
    pub fn new(backend: &'a dyn SearchBackend, batch_size: usize, mode: SubmitMode) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            mode,
        }
    }

    /// Drain `source` into the backend
    ///
    /// Per-item failures are counted and logged. The first source error or
    /// backend-level error stops the run and is returned; batches still in
    /// flight at that point are dropped and never acknowledged.
    pub async fn run<S: ActionSource>(&self, source: &mut S) -> Result<SubmitSummary> {
        let batch_size = self.batch_size;
        let tracker = WriteTracker::default();
        let tracker = &tracker;

        let batches = stream::unfold((Some(&mut *source), 0u64), move |(state, number)| async move {
            let Some(source) = state else {
                return None;
            };
            source.acknowledge(tracker.written()).await;
            match source.next_batch(batch_size).await {
                Ok(batch) if batch.is_empty() => None,
                Ok(batch) => Some((Ok((number, batch)), (Some(source), number + 1))),
                Err(e) => Some((Err(e), (None, number))),
            }
        });

        let submissions = batches.map(|batch| async move {
            let (number, batch) = batch?;
            self.submit(batch)
                .await
                .inspect(|_| tracker.answer(number))
        });

        let result = match self.mode {
            SubmitMode::Sequential => drain(submissions.buffered(1)).await,
            SubmitMode::Concurrent { .. } => {
                drain(submissions.buffer_unordered(self.mode.in_flight())).await
            },
        };
        source.acknowledge(tracker.written()).await;
        let summary = result?;

        info!(
            batches = summary.batches,
            succeeded = summary.succeeded,
            failed = summary.failed_items,
            "Submission finished"
        );
        Ok(summary)
    }

    async fn submit(&self, batch: Vec<WriteOperation>) -> Result<BulkOutcome> {
        let outcome = self.backend.bulk(&batch).await?;

        if outcome.failed() > 0 {
            for item in outcome.failures().take(LOGGED_FAILURES_PER_BATCH) {
                warn!(
                    id = %item.document_id,
                    error = item.error.as_deref().unwrap_or("unknown"),
                    "Document rejected by backend"
                );
            }
            warn!(
                failed = outcome.failed(),
                size = batch.len(),
                "Bulk request had item failures"
            );
        } else {
            debug!(size = batch.len(), "Bulk request complete");
        }

        Ok(outcome)
    }
}

async fn drain<St>(results: St) -> Result<SubmitSummary>
where
    St: futures::Stream<Item = Result<BulkOutcome>>,
{
    let mut results = std::pin::pin!(results);
    let mut summary = SubmitSummary::default();
    while let Some(result) = results.next().await {
        summary.absorb(&result?);
    }
    Ok(summary)
}
