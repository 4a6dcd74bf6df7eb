//! Index Persistence
//!
//! Durable, crash-safe storage of the ordered cache-name list for one
//! origin. The index is a versioned JSON record written to a temporary file
//! and atomically renamed over the canonical one, so a failed write never
//! clobbers the previous index. In memory-only mode both operations are
//! no-ops.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Canonical index file name within the origin's storage root
pub const INDEX_FILE_NAME: &str = "index.txt";
/// Temporary sibling used for the atomic-rename write
pub const INDEX_TMP_FILE_NAME: &str = "index.txt.tmp";

/// Current index container version
const INDEX_VERSION: u32 = 1;

/// Serialized index container
#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    version: u32,
    origin: String,
    caches: Vec<IndexCacheRecord>,
}

/// One named cache in the index
#[derive(Debug, Serialize, Deserialize)]
struct IndexCacheRecord {
    name: String,
}

/// Index reader/writer for one origin
pub struct CacheIndex {
    origin: String,
    /// Storage root; `None` in memory-only mode
    root: Option<PathBuf>,
}

impl CacheIndex {
    /// Create an index over `root`, or a memory-only no-op index
    pub fn new(origin: impl Into<String>, root: Option<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            root,
        }
    }

    /// Persist the ordered cache names
    ///
    /// Returns `Ok(false)` in memory-only mode (nothing persisted, by
    /// design); callers treat a write failure as best-effort.
    pub async fn write(&self, names: &[String]) -> Result<bool> {
        let Some(root) = &self.root else {
            return Ok(false);
        };

        let record = IndexRecord {
            version: INDEX_VERSION,
            origin: self.origin.clone(),
            caches: names
                .iter()
                .map(|name| IndexCacheRecord { name: name.clone() })
                .collect(),
        };
        let serialized =
            serde_json::to_vec(&record).map_err(|e| crate::error::Error::storage(e.to_string()))?;

        let tmp_path = root.join(INDEX_TMP_FILE_NAME);
        let index_path = root.join(INDEX_FILE_NAME);

        if let Err(e) = tokio::fs::write(&tmp_path, &serialized).await {
            // Leave the canonical file untouched; the old index stays valid.
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &index_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(origin = %self.origin, caches = names.len(), "index written");
        Ok(true)
    }

    /// Load the ordered cache names
    ///
    /// An absent index file is an empty list, not an error. A file that
    /// exists but does not parse is downgraded to an empty list as well,
    /// but logged distinctly from the no-index-yet case.
    pub async fn load(&self) -> Result<Vec<String>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };

        let index_path = root.join(INDEX_FILE_NAME);
        let raw = match tokio::fs::read(&index_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(origin = %self.origin, "no index file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<IndexRecord>(&raw) {
            Ok(record) => Ok(record.caches.into_iter().map(|c| c.name).collect()),
            Err(e) => {
                warn!(
                    origin = %self.origin,
                    path = %index_path.display(),
                    error = %e,
                    "index file is unreadable, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Path of the canonical index file, if persistent
    pub fn index_path(&self) -> Option<PathBuf> {
        self.root.as_deref().map(|r| r.join(INDEX_FILE_NAME))
    }

    /// The storage root, if persistent
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

// =============================================================================
// Tests
// =============================================================================
