//! The shard summary read by the static site to build its month picker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::fs;
use tracing::{info, instrument, warn};

use super::{INDEX_FILE, ShardStore, StoreError, write_json_atomic};
use crate::models::Item;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardIndex {
    /// `YYYY-MM` keys, oldest first.
    pub months: Vec<String>,
    pub counts: BTreeMap<String, usize>,
    pub generated_at: DateTime<Utc>,
}

/// Scan every shard on disk, count its items and write `index.json`.
///
/// Nothing is cached between calls, so the summary always reflects exactly
/// the shards present right now. A shard that cannot be parsed is logged and
/// left out of the summary.
#[instrument(level = "info", skip_all, fields(root = %store.root().display()))]
pub async fn rebuild_index(store: &ShardStore) -> Result<ShardIndex, StoreError> {
    let mut counts = BTreeMap::new();
    for (year, month, path) in store.list().await? {
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable shard");
                continue;
            }
        };
        match serde_json::from_str::<Vec<Item>>(&raw) {
            Ok(items) => {
                counts.insert(format!("{year:04}-{month:02}"), items.len());
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unparseable shard"),
        }
    }

    let index = ShardIndex {
        months: counts.keys().cloned().collect(),
        counts,
        generated_at: Utc::now(),
    };
    write_json_atomic(&store.root().join(INDEX_FILE), &index).await?;
    info!(shards = index.months.len(), "Rebuilt shard index");
    Ok(index)
}
