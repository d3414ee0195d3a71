//! Search backend abstraction
//!
//! The pipeline only needs a handful of calls from the search cluster:
//! provision a collection, bulk-upsert documents, refresh, and read/write a
//! single document (used by the backend-hosted progress store). Everything
//! else (querying, ranking, cluster administration) stays with the backend.

use async_trait::async_trait;
use isis_common::Result;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::record::{Record, WriteOperation};

pub mod elasticsearch;

pub use elasticsearch::ElasticsearchBackend;

/// Per-item result of a bulk request, in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub document_id: String,
    /// Backend-reported reason when the item was not written
    pub error: Option<String>,
}

impl ItemResult {
    pub fn ok(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            error: None,
        }
    }

    pub fn failed(document_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one bulk request that reached the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub items: Vec<ItemResult>,
}

impl BulkOutcome {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| !item.is_ok())
    }
}

/// Operations the ingestion pipeline needs from a search cluster
///
/// Errors returned from these methods are fatal for the run: the backend is
/// unreachable or refused the request outright. Individual document failures
/// inside a bulk request are reported through [`BulkOutcome`] instead.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Create `collection` with `mappings` unless it already exists
    async fn ensure_collection(&self, collection: &str, mappings: &Value) -> Result<()>;

    /// Upsert a batch of documents as one request
    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkOutcome>;

    /// Make recent writes visible to search
    async fn refresh(&self, collection: &str) -> Result<()>;

    /// Fetch a stored document body, `None` when absent
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Create or overwrite a single document
    async fn put_document(&self, collection: &str, id: &str, document: &Value) -> Result<()>;
}

/// Field mapping for record collections
///
/// Mirrors the CDS/ISIS field layout: exact-match id/year/prefix, analysed
/// title and content, plus a raw keyword copy of the title for sorting.
pub fn record_mappings() -> Value {
    json!({
        "properties": {
            "id": {"type": "keyword"},
            "title": {
                "type": "text",
                "analyzer": "english",
                "fields": {"raw": {"type": "keyword"}}
            },
            "content": {"type": "text", "analyzer": "english"},
            "year": {"type": "keyword"},
            "prefix": {"type": "keyword"}
        }
    })
}

/// In-process backend with upsert semantics
///
/// Used for dry runs and tests. Supports failure injection so pipeline
/// behaviour under per-item rejections and outages can be exercised.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    mappings: HashMap<String, Value>,
    bulk_sizes: Vec<usize>,
    refreshes: usize,
    rejected_ids: HashSet<String>,
    /// Number of further bulk calls that succeed before the backend goes away
    bulk_budget: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report a per-item failure for every write of `id`
    pub fn reject_id(&self, id: impl Into<String>) {
        self.state().rejected_ids.insert(id.into());
    }

    /// Let `calls` more bulk requests through, then fail as unreachable
    pub fn fail_bulk_after(&self, calls: usize) {
        self.state().bulk_budget = Some(calls);
    }

    /// Bring the backend back after [`MemoryBackend::fail_bulk_after`]
    pub fn restore(&self) {
        self.state().bulk_budget = None;
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        let state = self.state();
        let doc = state.collections.get(collection)?.get(id)?;
        serde_json::from_value(doc.clone()).ok()
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.state()
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.state().mappings.contains_key(collection)
    }

    /// Sizes of every bulk request received, in arrival order
    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.state().bulk_sizes.clone()
    }

    pub fn refreshes(&self) -> usize {
        self.state().refreshes
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn ensure_collection(&self, collection: &str, mappings: &Value) -> Result<()> {
        let mut state = self.state();
        state
            .mappings
            .entry(collection.to_string())
            .or_insert_with(|| mappings.clone());
        state.collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkOutcome> {
        let mut state = self.state();

        if let Some(budget) = state.bulk_budget.as_mut() {
            if *budget == 0 {
                return Err(isis_common::IsisError::network(
                    "memory backend unavailable",
                ));
            }
            *budget -= 1;
        }

        state.bulk_sizes.push(operations.len());

        let mut items = Vec::with_capacity(operations.len());
        for op in operations {
            if state.rejected_ids.contains(&op.document_id) {
                items.push(ItemResult::failed(&op.document_id, "rejected by memory backend"));
                continue;
            }

            let doc = serde_json::to_value(&op.document)?;
            state
                .collections
                .entry(op.collection.clone())
                .or_default()
                .insert(op.document_id.clone(), doc);
            items.push(ItemResult::ok(&op.document_id));
        }

        Ok(BulkOutcome { items })
    }

    async fn refresh(&self, _collection: &str) -> Result<()> {
        self.state().refreshes += 1;
        Ok(())
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .state()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn put_document(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
        self.state()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }
}
