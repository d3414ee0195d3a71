//! Run statistics and progress reporting

use indicatif::HumanCount;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Records per second, 0 when no time has elapsed
pub fn rate(records: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        records as f64 / elapsed_seconds
    } else {
        0.0
    }
}

/// Counters owned by the action stream while it produces operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Operations emitted
    pub records: u64,
    /// Malformed lines and unreadable files
    pub errors: u64,
    /// Parsed lines the extractor turned down
    pub rejected: u64,
}

/// Point-in-time view of a running build, handed to a [`ProgressReporter`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub records: u64,
    pub errors: u64,
    pub rejected: u64,
    pub elapsed: Duration,
    /// 1-based position of the file being read, 0 for in-memory sources
    pub file_index: usize,
    pub file_count: usize,
    pub current_file: Option<String>,
    /// Expected record total, when the source knows it
    pub total_hint: Option<u64>,
}

impl ProgressSnapshot {
    pub fn rate(&self) -> f64 {
        rate(self.records, self.elapsed.as_secs_f64())
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total_hint {
            Some(total) if total > 0 => Some(self.records as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records | {} rec/sec",
            HumanCount(self.records),
            HumanCount(self.rate() as u64)
        )?;

        if let Some(percent) = self.percent() {
            write!(f, " | {:.1}%", percent)?;
        }

        if self.file_count > 0 {
            write!(f, " | File {}/{}", self.file_index, self.file_count)?;
        }

        if self.errors > 0 {
            write!(f, " | {} errors", HumanCount(self.errors))?;
        }

        Ok(())
    }
}

/// Receives progress snapshots from the action stream
pub trait ProgressReporter: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Writes each snapshot as an `info` event
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        info!(
            records = snapshot.records,
            errors = snapshot.errors,
            file = snapshot.current_file.as_deref().unwrap_or("-"),
            "{}",
            snapshot
        );
    }
}

/// Final statistics of one build invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub total_records: u64,
    pub total_errors: u64,
    pub total_rejected: u64,
    /// Items the backend refused inside otherwise successful bulk requests
    pub failed_items: u64,
    pub batches_submitted: u64,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub elapsed_seconds: f64,
}

impl RunStats {
    pub fn rate_per_second(&self) -> f64 {
        rate(self.total_records, self.elapsed_seconds)
    }

    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed_seconds / 3600.0
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Records:      {}", HumanCount(self.total_records))?;
        writeln!(f, "Errors:       {}", HumanCount(self.total_errors))?;
        writeln!(f, "Rejected:     {}", HumanCount(self.total_rejected))?;
        writeln!(f, "Failed items: {}", HumanCount(self.failed_items))?;
        writeln!(f, "Batches:      {}", HumanCount(self.batches_submitted))?;
        writeln!(
            f,
            "Files:        {} processed, {} skipped",
            self.files_processed, self.files_skipped
        )?;
        writeln!(
            f,
            "Elapsed:      {:.2} hours ({:.1}s)",
            self.elapsed_hours(),
            self.elapsed_seconds
        )?;
        write!(
            f,
            "Rate:         {} records/sec",
            HumanCount(self.rate_per_second().round() as u64)
        )
    }
}
