//! Source file discovery
//!
//! Expands a glob pattern (with optional `**` recursive segments) into the
//! ordered list of files a build will read.

use isis_common::{IsisError, Result};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Find all regular files matching `pattern`, sorted lexicographically
///
/// An empty result is not an error. Entries that cannot be inspected
/// (permission errors while walking) are logged and skipped.
pub fn discover_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob::glob(pattern).map_err(|e| IsisError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(path) => debug!(path = %path.display(), "Skipping non-file match"),
            Err(e) => warn!(error = %e, "Error accessing path during discovery"),
        }
    }

    files.sort();
    files.dedup();

    debug!(pattern, count = files.len(), "Discovered source files");
    Ok(files)
}
