//! Ingestion and backend configuration
//!
//! Both structs load from environment variables with defaults for anything
//! unset; the binary overlays command-line flags afterwards.

use isis_common::{IsisError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Ingestion Defaults
// ============================================================================

/// Records per bulk request.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Records between progress lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;

/// Concurrent bulk requests in parallel mode.
pub const DEFAULT_WORKERS: usize = 4;

/// Completed files between progress checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 100;

// ============================================================================
// Backend Defaults
// ============================================================================

pub const DEFAULT_HOST: &str = "http://localhost:9200";

/// Generous enough for a 5000-document bulk request on a loaded cluster.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between attempts, multiplied by the attempt number.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

pub const DEFAULT_SHARDS: u32 = 5;

pub const DEFAULT_REPLICAS: u32 = 1;

pub const DEFAULT_REFRESH_INTERVAL: &str = "30s";

/// Collection holding one progress record per target collection.
pub const DEFAULT_META_COLLECTION: &str = "_isis_meta";

/// Settings for one build run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestConfig {
    pub batch_size: usize,
    /// 0 disables progress lines
    pub progress_interval: u64,
    pub workers: usize,
    pub checkpoint_interval: usize,
    /// Submit batches concurrently (unordered) instead of one at a time
    pub parallel: bool,
    /// Skip files already recorded as processed for the collection
    pub resume: bool,
    /// Stop the run once this many records have been emitted
    pub limit: Option<u64>,
    /// Also count extractor rejections in `total_errors`
    pub count_rejected_as_errors: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            workers: DEFAULT_WORKERS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            parallel: true,
            resume: true,
            limit: None,
            count_rejected_as_errors: false,
        }
    }
}

impl IngestConfig {
    /// Load from `ISIS_*` environment variables
    ///
    /// `ISIS_BATCH_SIZE`, `ISIS_PROGRESS_INTERVAL`, `ISIS_WORKERS`,
    /// `ISIS_CHECKPOINT_INTERVAL`, `ISIS_PARALLEL`, `ISIS_RESUME`,
    /// `ISIS_LIMIT`, `ISIS_COUNT_REJECTED`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            batch_size: env_or("ISIS_BATCH_SIZE", defaults.batch_size)?,
            progress_interval: env_or("ISIS_PROGRESS_INTERVAL", defaults.progress_interval)?,
            workers: env_or("ISIS_WORKERS", defaults.workers)?,
            checkpoint_interval: env_or("ISIS_CHECKPOINT_INTERVAL", defaults.checkpoint_interval)?,
            parallel: env_or("ISIS_PARALLEL", defaults.parallel)?,
            resume: env_or("ISIS_RESUME", defaults.resume)?,
            limit: env_opt("ISIS_LIMIT")?,
            count_rejected_as_errors: env_or(
                "ISIS_COUNT_REJECTED",
                defaults.count_rejected_as_errors,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IsisError::config("batch_size must be greater than 0"));
        }

        if self.workers == 0 {
            return Err(IsisError::config("workers must be greater than 0"));
        }

        if self.checkpoint_interval == 0 {
            return Err(IsisError::config(
                "checkpoint_interval must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Connection and provisioning settings for the search backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Node URLs; requests rotate across them on retry
    pub hosts: Vec<String>,
    /// Takes precedence over basic auth
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub shards: u32,
    pub replicas: u32,
    pub refresh_interval: String,
    pub meta_collection: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            hosts: vec![DEFAULT_HOST.to_string()],
            api_key: None,
            username: None,
            password: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            shards: DEFAULT_SHARDS,
            replicas: DEFAULT_REPLICAS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL.to_string(),
            meta_collection: DEFAULT_META_COLLECTION.to_string(),
        }
    }
}

impl BackendConfig {
    /// Load from `ES_*` environment variables
    ///
    /// `ES_HOSTS` (comma separated), `ES_API_KEY`, `ES_USERNAME`,
    /// `ES_PASSWORD`, `ES_TIMEOUT_SECS`, `ES_MAX_RETRIES`,
    /// `ES_RETRY_DELAY_MS`, `ES_SHARDS`, `ES_REPLICAS`,
    /// `ES_REFRESH_INTERVAL`, `ISIS_META_COLLECTION`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let hosts = match std::env::var("ES_HOSTS") {
            Ok(hosts) => hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            Err(_) => defaults.hosts,
        };

        let config = Self {
            hosts,
            api_key: std::env::var("ES_API_KEY").ok(),
            username: std::env::var("ES_USERNAME").ok(),
            password: std::env::var("ES_PASSWORD").ok(),
            timeout_secs: env_or("ES_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: env_or("ES_MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: env_or("ES_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            shards: env_or("ES_SHARDS", defaults.shards)?,
            replicas: env_or("ES_REPLICAS", defaults.replicas)?,
            refresh_interval: std::env::var("ES_REFRESH_INTERVAL")
                .unwrap_or(defaults.refresh_interval),
            meta_collection: std::env::var("ISIS_META_COLLECTION")
                .unwrap_or(defaults.meta_collection),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(IsisError::config("at least one backend host is required"));
        }

        if self.max_retries == 0 {
            return Err(IsisError::config("max_retries must be at least 1"));
        }

        if self.shards == 0 {
            return Err(IsisError::config("shards must be greater than 0"));
        }

        if self.meta_collection.is_empty() {
            return Err(IsisError::config("meta collection name cannot be empty"));
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IsisError::config(format!("invalid value for {}: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
