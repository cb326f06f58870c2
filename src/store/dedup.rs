//! The dedup index: every identity key ever committed to a shard.
//!
//! Membership is the single source of truth for "new vs. duplicate". Keys are
//! marked in memory as items are committed and only become durable when
//! [`DedupIndex::save`] runs at a checkpoint.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use super::{StoreError, read_json_or_none, write_json_atomic};

#[derive(Debug, Clone)]
pub struct DedupIndex {
    path: PathBuf,
    keys: BTreeSet<String>,
}

impl DedupIndex {
    /// Load the index from `path`; a missing or corrupt file yields an empty index.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Self {
        let keys: BTreeSet<String> = read_json_or_none::<Vec<String>>(path)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        info!(keys = keys.len(), "Loaded dedup index");
        Self {
            path: path.to_path_buf(),
            keys,
        }
    }

    /// Build an index from an explicit key set, e.g. when rebuilding after a prune.
    pub fn from_keys(path: &Path, keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: path.to_path_buf(),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Add `key` in memory. Returns `false` if it was already present.
    pub fn mark(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string())
    }

    /// Persist the full key set, sorted, replacing the previous file atomically.
    pub async fn save(&self) -> Result<(), StoreError> {
        write_json_atomic(&self.path, &self.keys).await
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
