//! Offline maintenance over the data directory.
//!
//! Pruning drops items that carry no readable content, then rebuilds the
//! dedup index from what is left so that pruned URLs become eligible again.

use tracing::{info, instrument};

use crate::models::Item;
use crate::store::{DEDUP_FILE, DedupIndex, ShardStore, StoreError, rebuild_index};

/// Source labels with this prefix come from repository imports and are always kept.
pub const IMPORTED_SOURCE_PREFIX: &str = "GitHub: ";

/// Item counts across every shard, before and after a prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    /// Shards visited.
    pub shards: usize,
    pub before: usize,
    pub after: usize,
}

impl PruneReport {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// Whether `item` survives a prune: imported items always do, crawled ones
/// only when they carry content.
pub fn keep_item(item: &Item) -> bool {
    item.source.starts_with(IMPORTED_SOURCE_PREFIX) || item.has_content()
}

/// Rewrite every shard keeping only [`keep_item`] items, then rebuild the
/// dedup index and shard summary from the result.
///
/// A corrupt shard aborts the pass before anything is rewritten from it.
#[instrument(level = "info", skip_all, fields(root = %store.root().display()))]
pub async fn prune(store: &ShardStore) -> Result<PruneReport, StoreError> {
    let mut report = PruneReport {
        shards: 0,
        before: 0,
        after: 0,
    };
    let mut ids = Vec::new();

    for (year, month, _) in store.list().await? {
        let items = store.load(year, month).await?;
        report.shards += 1;
        report.before += items.len();
        let kept: Vec<Item> = items.into_iter().filter(keep_item).collect();
        report.after += kept.len();
        ids.extend(kept.iter().map(|item| item.id.clone()));
        store.save(year, month, kept).await?;
    }

    DedupIndex::from_keys(&store.root().join(DEDUP_FILE), ids)
        .save()
        .await?;
    rebuild_index(store).await?;

    info!(
        shards = report.shards,
        before = report.before,
        after = report.after,
        removed = report.removed(),
        "Prune finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::index::ShardIndex;
    use chrono::{TimeZone, Utc};

    fn item(url: &str, source: &str, month: u32, content: &str) -> Item {
        let mut item = Item::new(url, source, Utc.with_ymd_and_hms(2025, month, 3, 0, 0, 0).unwrap());
        item.content_text = content.to_string();
        item
    }

    #[tokio::test]
    async fn test_prune_keeps_content_and_imports() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let keep = item("https://pub.com/full", "Pub", 1, "Body");
        let import = item("https://github.com/x/y/blob/main/a.md", "GitHub: x/y", 1, "");
        for it in [
            &keep,
            &import,
            &item("https://pub.com/empty", "Pub", 1, "   "),
            &item("https://pub.com/feb", "Pub", 2, ""),
        ] {
            store.append(it).await.unwrap();
        }
        std::fs::write(dir.path().join(DEDUP_FILE), "[\"stale\"]").unwrap();

        let report = prune(&store).await.unwrap();
        assert_eq!(
            report,
            PruneReport {
                shards: 2,
                before: 4,
                after: 2
            }
        );
        assert_eq!(report.removed(), 2);

        let jan = store.load(2025, 1).await.unwrap();
        assert_eq!(jan.len(), 2);
        assert!(store.load(2025, 2).await.unwrap().is_empty());

        let dedup = DedupIndex::load(&dir.path().join(DEDUP_FILE)).await;
        assert_eq!(dedup.len(), 2);
        assert!(dedup.contains(&keep.id) && dedup.contains(&import.id));
        assert!(!dedup.contains("stale"));

        let index: ShardIndex =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index.counts["2025-01"], 2);
        assert_eq!(index.counts["2025-02"], 0);
    }

    #[tokio::test]
    async fn test_prune_refuses_corrupt_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("2025")).unwrap();
        std::fs::write(store.shard_path(2025, 1), "{broken").unwrap();

        assert!(matches!(prune(&store).await, Err(StoreError::CorruptShard { .. })));
        assert_eq!(std::fs::read_to_string(store.shard_path(2025, 1)).unwrap(), "{broken");
    }
}
