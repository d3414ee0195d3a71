//! End-to-end builds against the in-memory backend

#![allow(clippy::unwrap_used, clippy::expect_used)]

use isis_ingest::backend::MemoryBackend;
use isis_ingest::progress::{BackendProgressStore, FileProgressStore, ProgressStore};
use isis_ingest::{DataCiteExtractor, IndexBuilder, IngestConfig, Record, RecordExtractor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const FILES: usize = 5;
const RECORDS_PER_FILE: usize = 4;

struct Corpus {
    dir: TempDir,
}

impl Corpus {
    fn new() -> Self {
        let corpus = Self {
            dir: TempDir::new().unwrap(),
        };
        for file in 0..FILES {
            let lines: Vec<String> = (0..RECORDS_PER_FILE)
                .map(|i| datacite_line(&format!("10.1234/f{}-r{}", file, i), "Original"))
                .collect();
            // Half the files sit one level deeper to exercise `**`
            let sub = if file % 2 == 0 { "" } else { "nested" };
            corpus.write(&format!("{}/part-{}.jsonl", sub, file), &lines);
        }
        corpus
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn progress_dir(&self) -> PathBuf {
        self.dir.path().join("progress")
    }

    fn pattern(&self) -> String {
        format!("{}/**/*.jsonl", self.data_dir().display())
    }

    fn write(&self, relative: &str, lines: &[String]) -> PathBuf {
        let path = self.data_dir().join(relative.trim_start_matches('/'));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn store(&self) -> Arc<FileProgressStore> {
        Arc::new(FileProgressStore::new(self.progress_dir()))
    }
}

fn datacite_line(id: &str, title: &str) -> String {
    json!({
        "id": id,
        "type": "dois",
        "attributes": {
            "titles": [{"title": title}],
            "descriptions": [{"description": format!("About {}", id)}],
            "publicationYear": 2021,
            "prefix": "10.1234"
        }
    })
    .to_string()
}

fn sequential(batch_size: usize, checkpoint_interval: usize) -> IngestConfig {
    IngestConfig {
        batch_size,
        checkpoint_interval,
        parallel: false,
        progress_interval: 0,
        ..Default::default()
    }
}

fn concurrent(batch_size: usize, workers: usize) -> IngestConfig {
    IngestConfig {
        batch_size,
        workers,
        parallel: true,
        checkpoint_interval: 1,
        progress_interval: 0,
        ..Default::default()
    }
}

async fn open(
    backend: &Arc<MemoryBackend>,
    store: Arc<dyn ProgressStore>,
    config: IngestConfig,
) -> IndexBuilder {
    IndexBuilder::new("corpus", backend.clone(), store, config)
        .await
        .unwrap()
}

fn snapshot(backend: &MemoryBackend) -> Vec<(String, Record)> {
    backend
        .ids("corpus")
        .into_iter()
        .map(|id| {
            let record = backend.record("corpus", &id).unwrap();
            (id, record)
        })
        .collect()
}

async fn single_pass(corpus: &Corpus) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(FileProgressStore::new(corpus.dir.path().join("reference")));
    let mut builder = open(&backend, store, sequential(RECORDS_PER_FILE, 1)).await;
    builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();
    backend
}

#[tokio::test]
async fn test_full_build() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());
    let mut builder = open(&backend, corpus.store(), IngestConfig::default()).await;

    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.total_records, (FILES * RECORDS_PER_FILE) as u64);
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.files_processed, FILES);
    assert_eq!(stats.files_skipped, 0);
    assert_eq!(backend.count("corpus"), FILES * RECORDS_PER_FILE);
    assert_eq!(backend.refreshes(), 1);

    let record = backend.record("corpus", "10.1234/f3-r2").unwrap();
    assert_eq!(record.title, "Original");
    assert_eq!(record.content, "About 10.1234/f3-r2");
    assert_eq!(record.year, "2021");
    assert_eq!(record.prefix, "10.1234");

    assert_eq!(corpus.store().load("corpus").await.len(), FILES);
}

#[tokio::test]
async fn test_resume_after_interruption_matches_single_pass() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());

    // One file per batch; the third bulk request finds the backend gone
    backend.fail_bulk_after(2);
    let mut builder = open(&backend, corpus.store(), sequential(RECORDS_PER_FILE, 1)).await;
    let err = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(backend.count("corpus"), 2 * RECORDS_PER_FILE);
    assert_eq!(backend.refreshes(), 0);

    let checkpointed = corpus.store().load("corpus").await;
    assert_eq!(checkpointed.len(), 2);

    backend.restore();
    let mut builder = open(&backend, corpus.store(), sequential(RECORDS_PER_FILE, 1)).await;
    assert_eq!(builder.processed_files(), &checkpointed);

    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.files_skipped, 2);
    assert_eq!(stats.total_records, ((FILES - 2) * RECORDS_PER_FILE) as u64);
    assert_eq!(stats.files_processed, FILES);
    assert_eq!(
        backend.bulk_sizes().len(),
        2 + FILES - 2,
        "completed files must not be sent again"
    );

    let reference = single_pass(&corpus).await;
    assert_eq!(snapshot(&backend), snapshot(&reference));
}

#[tokio::test]
async fn test_crash_before_checkpoint_loses_no_file() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());

    backend.fail_bulk_after(3);
    let mut builder = open(&backend, corpus.store(), sequential(RECORDS_PER_FILE, 100)).await;
    assert!(builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .is_err());
    assert!(corpus.store().load("corpus").await.is_empty());

    backend.restore();
    let mut builder = open(&backend, corpus.store(), sequential(RECORDS_PER_FILE, 100)).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.files_skipped, 0);
    assert_eq!(stats.total_records, (FILES * RECORDS_PER_FILE) as u64);
    assert_eq!(backend.count("corpus"), FILES * RECORDS_PER_FILE);
}

/// Ids the standard corpus puts in the file stored under `key`
fn corpus_ids(key: &str) -> Vec<String> {
    let file = key
        .rsplit("part-")
        .next()
        .unwrap()
        .trim_end_matches(".jsonl");
    (0..RECORDS_PER_FILE)
        .map(|i| format!("10.1234/f{}-r{}", file, i))
        .collect()
}

/// Fail the backend after `healthy` bulk requests, resume, and compare the
/// result with an uninterrupted build
async fn crash_and_resume(config: IngestConfig, healthy: usize) {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());

    backend.fail_bulk_after(healthy);
    let mut builder = open(&backend, corpus.store(), config.clone()).await;
    let err = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap_err();
    assert!(err.is_connectivity());

    for key in corpus.store().load("corpus").await {
        for id in corpus_ids(&key) {
            assert!(
                backend.record("corpus", &id).is_some(),
                "{} was checkpointed before {} was written",
                key,
                id
            );
        }
    }

    backend.restore();
    let mut builder = open(&backend, corpus.store(), config).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();
    assert_eq!(stats.files_processed, FILES);

    let reference = single_pass(&corpus).await;
    assert_eq!(snapshot(&backend), snapshot(&reference));
}

#[tokio::test]
async fn test_crash_with_files_in_an_unsent_batch() {
    let corpus = Corpus::new();
    let lines = |file: usize| -> Vec<String> {
        (0..2)
            .map(|i| datacite_line(&format!("10.9/s{}-{}", file, i), "Small"))
            .collect()
    };
    for file in 0..3 {
        corpus.write(&format!("small/part-{}.jsonl", file), &lines(file));
    }
    let pattern = format!("{}/small/*.jsonl", corpus.data_dir().display());
    let backend = Arc::new(MemoryBackend::new());

    // All three files are read to the end inside the one batch that fails
    backend.fail_bulk_after(0);
    let mut builder = open(&backend, corpus.store(), sequential(100, 1)).await;
    assert!(builder
        .add_jsonl_files(&pattern, Arc::new(DataCiteExtractor))
        .await
        .is_err());
    assert_eq!(backend.count("corpus"), 0);
    assert!(corpus.store().load("corpus").await.is_empty());

    backend.restore();
    let mut builder = open(&backend, corpus.store(), sequential(100, 1)).await;
    let stats = builder
        .add_jsonl_files(&pattern, Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.files_skipped, 0);
    assert_eq!(stats.total_records, 6);
    assert_eq!(backend.count("corpus"), 6);
    assert_eq!(corpus.store().load("corpus").await.len(), 3);
}

#[tokio::test]
async fn test_sequential_crash_with_files_split_across_batches() {
    // Six records per batch over four-record files
    crash_and_resume(sequential(6, 1), 1).await;
    crash_and_resume(sequential(6, 1), 2).await;
}

#[tokio::test]
async fn test_sequential_crash_with_batch_larger_than_a_file() {
    crash_and_resume(sequential(10, 1), 1).await;
    crash_and_resume(sequential(100, 1), 0).await;
}

#[tokio::test]
async fn test_concurrent_crash_with_files_split_across_batches() {
    crash_and_resume(concurrent(3, 3), 2).await;
    crash_and_resume(concurrent(3, 3), 4).await;
    crash_and_resume(concurrent(6, 2), 1).await;
}

#[tokio::test]
async fn test_concurrent_crash_with_batch_larger_than_a_file() {
    crash_and_resume(concurrent(10, 3), 1).await;
    crash_and_resume(concurrent(100, 3), 0).await;
}

#[tokio::test]
async fn test_limit_then_resume() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());

    let limited = IngestConfig {
        limit: Some(6),
        ..sequential(100, 100)
    };
    let mut builder = open(&backend, corpus.store(), limited).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 6);
    assert_eq!(backend.count("corpus"), 6);
    // The first file completed, the second was cut off mid-way
    assert_eq!(stats.files_processed, 1);

    let mut builder = open(&backend, corpus.store(), sequential(100, 100)).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.files_skipped, 1);
    assert_eq!(
        stats.total_records,
        ((FILES - 1) * RECORDS_PER_FILE) as u64
    );
    assert_eq!(backend.count("corpus"), FILES * RECORDS_PER_FILE);
}

#[tokio::test]
async fn test_malformed_lines_are_tolerated() {
    let corpus = Corpus::new();
    let mut lines: Vec<String> = (0..10)
        .map(|i| datacite_line(&format!("10.9/m{}", i), "Mixed"))
        .collect();
    lines.insert(2, r#"{"id": "10.9/broken", "attributes": "#.to_string());
    lines.insert(8, "\u{1}garbage".to_string());
    let mixed = corpus.write("mixed.jsonl", &lines);

    let backend = Arc::new(MemoryBackend::new());
    let mut builder = open(&backend, corpus.store(), IngestConfig::default()).await;
    let stats = builder
        .add_jsonl_files(&mixed.display().to_string(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    assert_eq!(stats.total_records, 10);
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.files_processed, 1);
    assert!(builder.processed_files().contains(&path_key(&mixed)));
}

#[tokio::test]
async fn test_reingesting_an_id_overwrites_it() {
    let corpus = Corpus::new();
    let first = corpus.write("dups/a-first.jsonl", &[datacite_line("10.9/dup", "Draft")]);
    corpus.write("dups/b-second.jsonl", &[datacite_line("10.9/dup", "Final")]);

    let backend = Arc::new(MemoryBackend::new());
    let mut builder = open(&backend, corpus.store(), sequential(10, 100)).await;
    let stats = builder
        .add_jsonl_files(
            &format!("{}/*.jsonl", first.parent().unwrap().display()),
            Arc::new(DataCiteExtractor),
        )
        .await
        .unwrap();

    assert_eq!(stats.total_records, 2);
    assert_eq!(backend.count("corpus"), 1);
    assert_eq!(backend.record("corpus", "10.9/dup").unwrap().title, "Final");
}

#[tokio::test]
async fn test_rejections_are_visible() {
    let corpus = Corpus::new();
    let path = corpus.write(
        "rejects.jsonl",
        &[
            datacite_line("10.9/ok", "Fine"),
            r#"{"attributes": {"titles": []}}"#.to_string(),
            r#"{"id": "10.9/bad", "attributes": {"titles": "not a list"}}"#.to_string(),
        ],
    );
    let pattern = path.display().to_string();

    let backend = Arc::new(MemoryBackend::new());
    let mut builder = open(&backend, corpus.store(), sequential(10, 100)).await;
    let stats = builder
        .add_jsonl_files(&pattern, Arc::new(DataCiteExtractor))
        .await
        .unwrap();
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.total_rejected, 2);
    assert_eq!(stats.total_errors, 0);

    let counting = IngestConfig {
        resume: false,
        count_rejected_as_errors: true,
        ..sequential(10, 100)
    };
    let mut builder = open(&backend, corpus.store(), counting).await;
    let stats = builder
        .add_jsonl_files(&pattern, Arc::new(DataCiteExtractor))
        .await
        .unwrap();
    assert_eq!(stats.total_rejected, 2);
    assert_eq!(stats.total_errors, 2);
}

#[tokio::test]
async fn test_custom_extractor_and_concurrent_submission() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());

    let extractor = |raw: &Value| -> Option<Record> {
        let id = raw.get("id")?.as_str()?;
        Some(Record::new(id.to_uppercase(), "custom").with_year("n/a"))
    };

    let config = IngestConfig {
        batch_size: 3,
        workers: 3,
        progress_interval: 0,
        ..Default::default()
    };
    let mut builder = open(&backend, corpus.store(), config).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(extractor))
        .await
        .unwrap();

    let total = FILES * RECORDS_PER_FILE;
    assert_eq!(stats.total_records, total as u64);
    assert_eq!(stats.batches_submitted, total.div_ceil(3) as u64);
    assert_eq!(backend.count("corpus"), total);
    assert_eq!(
        backend.record("corpus", "10.1234/F0-R0").unwrap().title,
        "custom"
    );
    assert!(extractor.extract(&json!({"id": 7})).is_none());
}

#[tokio::test]
async fn test_progress_in_backend_meta_collection() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(
        BackendProgressStore::open(backend.clone(), "_isis_meta")
            .await
            .unwrap(),
    );

    let mut builder = open(&backend, store.clone(), sequential(50, 100)).await;
    builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();

    let doc = backend
        .ids("_isis_meta")
        .into_iter()
        .find(|id| id == "progress_corpus");
    assert!(doc.is_some());
    assert_eq!(store.load("corpus").await.len(), FILES);

    let mut builder = open(&backend, store, sequential(50, 100)).await;
    let stats = builder
        .add_jsonl_files(&corpus.pattern(), Arc::new(DataCiteExtractor))
        .await
        .unwrap();
    assert_eq!(stats.files_skipped, FILES);
    assert_eq!(stats.total_records, 0);
}

#[tokio::test]
async fn test_no_matching_files_is_an_empty_build() {
    let corpus = Corpus::new();
    let backend = Arc::new(MemoryBackend::new());
    let mut builder = open(&backend, corpus.store(), IngestConfig::default()).await;

    let stats = builder
        .add_jsonl_files(
            &format!("{}/*.parquet", corpus.data_dir().display()),
            Arc::new(DataCiteExtractor),
        )
        .await
        .unwrap();

    assert_eq!(stats.total_records, 0);
    assert_eq!(stats.batches_submitted, 0);
    assert_eq!(stats.rate_per_second(), 0.0);
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
