//! Persistent state: monthly shards, the dedup index and the shard summary.
//!
//! Every artifact is a pretty-printed UTF-8 JSON file so the data directory
//! stays human-diffable when it is committed to version control.
//!
//! # Layout
//!
//! ```text
//! data_dir/
//! ├── 2025/
//! │   ├── 01.json            # shard: items published in January 2025
//! │   └── 02.json
//! ├── dedup.json             # every identity key ever committed
//! ├── index.json             # per-shard counts + generation time
//! └── backfill_state.json    # backfill cursor (see crawl::progress)
//! ```
//!
//! # Atomicity
//!
//! All writes go through [`write_json_atomic`]: the body is written to a
//! sibling `.tmp` file, synced, then renamed over the target, so a crash
//! mid-write never leaves a truncated file behind. The artifacts are not
//! committed together; see `crawl::harvester` for the resulting guarantee.

pub mod dedup;
pub mod index;
pub mod shards;

pub use dedup::DedupIndex;
pub use index::rebuild_index;
pub use shards::ShardStore;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// File name of the dedup index inside the data directory.
pub const DEDUP_FILE: &str = "dedup.json";
/// File name of the shard summary inside the data directory.
pub const INDEX_FILE: &str = "index.json";
/// File name of the backfill cursor inside the data directory.
pub const PROGRESS_FILE: &str = "backfill_state.json";

/// Errors raised while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("shard {} is unreadable: {source}", path.display())]
    CorruptShard {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let body = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(StoreError::io(parent))?;
    }

    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).await.map_err(StoreError::io(&tmp))?;
    file.write_all(body.as_bytes())
        .await
        .map_err(StoreError::io(&tmp))?;
    file.write_all(b"\n").await.map_err(StoreError::io(&tmp))?;
    file.sync_all().await.map_err(StoreError::io(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).await.map_err(StoreError::io(path))?;
    debug!(path = %path.display(), bytes = body.len(), "Wrote JSON atomically");
    Ok(())
}

/// Read a checkpoint file, treating a missing or unparseable file as "no state".
pub async fn read_json_or_none<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No prior state file");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "State file unreadable; starting fresh");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "State file unparseable; starting fresh");
            None
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_write_json_atomic_replaces_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &vec![1, 2, 3]).await.unwrap();
        write_json_atomic(&path, &vec![4]).await.unwrap();

        let back: Vec<u32> = read_json_or_none(&path).await.unwrap();
        assert_eq!(back, vec![4]);
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_read_json_or_none_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_json_or_none::<BTreeMap<String, u32>>(&missing).await.is_none());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert!(read_json_or_none::<BTreeMap<String, u32>>(&corrupt).await.is_none());
    }

    #[test]
    fn test_tmp_path_is_sibling() {
        let path = Path::new("/data/2025/03.json");
        assert_eq!(tmp_path(path), PathBuf::from("/data/2025/03.json.tmp"));
    }
}
