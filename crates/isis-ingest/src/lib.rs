//! Resumable bulk ingestion of JSON-lines corpora into a search backend
//!
//! The pipeline reads source files lazily, turns each line into a
//! [`record::Record`] through a pluggable [`record::RecordExtractor`], and
//! upserts the records in bounded batches. Completed files are tracked per
//! collection in a [`progress::ProgressStore`] so an interrupted build picks up
//! where it stopped.
//!
//! ```text
//! discovery ──▶ stream (JsonlActionStream) ──▶ submitter ──▶ backend
//!                  │           ▲
//!                  ▼           │ resume set
//!               progress ──────┘
//! ```
//!
//! Start with [`IndexBuilder`].

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod backend;
pub mod builder;
pub mod config;
pub mod discovery;
pub mod progress;
pub mod record;
pub mod stats;
pub mod stream;
pub mod submitter;

pub use backend::{ElasticsearchBackend, MemoryBackend, SearchBackend};
pub use builder::IndexBuilder;
pub use config::{BackendConfig, IngestConfig};
pub use record::{DataCiteExtractor, Record, RecordExtractor, WriteOperation};
pub use stats::RunStats;
