//! Monthly shards: `data_dir/YYYY/MM.json`.
//!
//! A shard holds every item whose publication timestamp falls in its calendar
//! month, sorted newest first for the static site. Shards are loaded and
//! rewritten as a unit; no operation spans more than one shard.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

use super::{StoreError, write_json_atomic};
use crate::models::Item;

#[derive(Debug, Clone)]
pub struct ShardStore {
    root: PathBuf,
}

impl ShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, year: i32, month: u32) -> PathBuf {
        self.root
            .join(format!("{year:04}"))
            .join(format!("{month:02}.json"))
    }

    /// Load one shard. A shard that does not exist yet is empty; a shard that
    /// exists but cannot be parsed is an error, since rewriting it would drop data.
    pub async fn load(&self, year: i32, month: u32) -> Result<Vec<Item>, StoreError> {
        let path = self.shard_path(year, month);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::CorruptShard { path, source })
    }

    /// Sort `items` newest first and atomically write them as the shard.
    pub async fn save(&self, year: i32, month: u32, mut items: Vec<Item>) -> Result<(), StoreError> {
        sort_newest_first(&mut items);
        write_json_atomic(&self.shard_path(year, month), &items).await
    }

    /// Append `item` to the shard selected by its publication timestamp.
    ///
    /// Returns `false` without writing when the shard already holds an item
    /// with the same id, which happens when a previous run was killed after
    /// the shard write but before the dedup index was saved.
    #[instrument(level = "debug", skip_all, fields(id = %item.id))]
    pub async fn append(&self, item: &Item) -> Result<bool, StoreError> {
        let (year, month) = item.shard();
        let mut items = self.load(year, month).await?;
        if items.iter().any(|existing| existing.id == item.id) {
            debug!(year, month, "Item already present in shard");
            return Ok(false);
        }
        items.push(item.clone());
        self.save(year, month, items).await?;
        debug!(year, month, "Appended item to shard");
        Ok(true)
    }

    /// Every shard currently on disk as `(year, month, path)`, oldest first.
    pub async fn list(&self) -> Result<Vec<(i32, u32, PathBuf)>, StoreError> {
        let mut shards = Vec::new();
        let mut years = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(shards),
            Err(e) => return Err(StoreError::Io { path: self.root.clone(), source: e }),
        };

        while let Some(entry) = years.next_entry().await.map_err(StoreError::io(&self.root))? {
            let Some(year) = parse_component::<i32>(&entry.file_name().to_string_lossy(), 4) else {
                continue;
            };
            let year_dir = entry.path();
            if !year_dir.is_dir() {
                continue;
            }
            let mut months = fs::read_dir(&year_dir).await.map_err(StoreError::io(&year_dir))?;
            while let Some(file) = months.next_entry().await.map_err(StoreError::io(&year_dir))? {
                let name = file.file_name().to_string_lossy().into_owned();
                let Some(stem) = name.strip_suffix(".json") else {
                    continue;
                };
                if let Some(month) = parse_component::<u32>(stem, 2).filter(|m| (1..=12).contains(m)) {
                    shards.push((year, month, file.path()));
                }
            }
        }
        shards.sort_by_key(|(y, m, _)| (*y, *m));
        Ok(shards)
    }
}

/// Shard order contract: newest `published_at` first, stable for ties.
pub fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
}

fn parse_component<T: std::str::FromStr>(s: &str, width: usize) -> Option<T> {
    if s.len() == width && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}
