//! Durable resume state
//!
//! One [`ProgressRecord`] per target collection holds the set of source files
//! that were fully read into the action stream. Loading never fails: a
//! missing or unreadable record means the build starts from scratch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isis_common::{IsisError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::SearchBackend;

/// Current layout of [`ProgressRecord`]
pub const PROGRESS_VERSION: u32 = 1;

/// Key under which a collection's progress is stored
pub fn progress_key(collection: &str) -> String {
    format!("progress_{}", collection)
}

/// Persisted progress for one collection
///
/// `processed_files` is a JSON-encoded array of paths so the backend can
/// store it as an opaque text field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "index_name")]
    pub collection_name: String,
    pub processed_files: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub version: u32,
}

impl ProgressRecord {
    pub fn new(collection: &str, files: &BTreeSet<String>) -> Result<Self> {
        Ok(Self {
            collection_name: collection.to_string(),
            processed_files: serde_json::to_string(files)?,
            last_updated: Utc::now(),
            version: PROGRESS_VERSION,
        })
    }

    pub fn files(&self) -> Result<BTreeSet<String>> {
        Ok(serde_json::from_str(&self.processed_files)?)
    }
}

/// Store for the processed-file set of each collection
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Previously saved set, empty when absent or unreadable
    async fn load(&self, collection: &str) -> BTreeSet<String>;

    /// Replace the stored set for `collection` (last write wins)
    async fn save(&self, collection: &str, files: &BTreeSet<String>) -> Result<()>;
}

/// Mapping of the metadata collection that holds progress records
pub fn progress_mappings() -> Value {
    json!({
        "properties": {
            "index_name": {"type": "keyword"},
            "processed_files": {"type": "text"},
            "last_updated": {"type": "date"}
        }
    })
}

/// Progress kept as documents in a metadata collection of the search backend
pub struct BackendProgressStore {
    backend: Arc<dyn SearchBackend>,
    meta_collection: String,
}

impl BackendProgressStore {
    /// Create the metadata collection if needed
    pub async fn open(backend: Arc<dyn SearchBackend>, meta_collection: &str) -> Result<Self> {
        backend
            .ensure_collection(meta_collection, &progress_mappings())
            .await?;

        Ok(Self {
            backend,
            meta_collection: meta_collection.to_string(),
        })
    }

    async fn try_load(&self, collection: &str) -> Result<Option<BTreeSet<String>>> {
        let Some(doc) = self
            .backend
            .get_document(&self.meta_collection, &progress_key(collection))
            .await?
        else {
            return Ok(None);
        };

        let record: ProgressRecord = serde_json::from_value(doc)?;
        record.files().map(Some)
    }
}

#[async_trait]
impl ProgressStore for BackendProgressStore {
    async fn load(&self, collection: &str) -> BTreeSet<String> {
        match self.try_load(collection).await {
            Ok(Some(files)) => {
                info!(collection, files = files.len(), "Loaded build progress");
                files
            },
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(collection, error = %e, "Ignoring unreadable build progress");
                BTreeSet::new()
            },
        }
    }

    async fn save(&self, collection: &str, files: &BTreeSet<String>) -> Result<()> {
        let record = serde_json::to_value(ProgressRecord::new(collection, files)?)?;
        self.backend
            .put_document(&self.meta_collection, &progress_key(collection), &record)
            .await
            .map_err(|e| IsisError::progress(format!("saving progress for {}: {}", collection, e)))?;

        debug!(collection, files = files.len(), "Saved build progress");
        Ok(())
    }
}

/// Progress kept as `progress_<collection>.json` files in a local directory
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", progress_key(collection)))
    }

    async fn try_load(&self, collection: &str) -> Result<Option<BTreeSet<String>>> {
        let bytes = match tokio::fs::read(self.path_for(collection)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: ProgressRecord = serde_json::from_slice(&bytes)?;
        record.files().map(Some)
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, collection: &str) -> BTreeSet<String> {
        match self.try_load(collection).await {
            Ok(Some(files)) => {
                info!(collection, files = files.len(), "Loaded build progress");
                files
            },
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(
                    collection,
                    path = %self.path_for(collection).display(),
                    error = %e,
                    "Ignoring unreadable build progress"
                );
                BTreeSet::new()
            },
        }
    }

    async fn save(&self, collection: &str, files: &BTreeSet<String>) -> Result<()> {
        let record = ProgressRecord::new(collection, files)?;
        let path = self.path_for(collection);
        let tmp = path.with_extension("json.tmp");

        let write = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<_, IsisError>(())
        };

        write.await.map_err(|e| {
            IsisError::progress(format!("writing {}: {}", path.display(), e))
        })?;

        debug!(collection, files = files.len(), "Saved build progress");
        Ok(())
    }
}
