//! Source registry and run settings.
//!
//! Both are built once at startup (see `main`) and passed by reference into
//! the crawl engine, which never reads the environment itself.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::{info, instrument};

/// Errors raised while loading or validating the source registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read source registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid source registry {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid source registry: {0}")]
    Invalid(String),
}

/// One publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable short key, e.g. `ars_technica`.
    pub key: String,
    /// Label stored in each item's `source` field.
    pub display_name: String,
    /// Root sitemap or sitemap index; sources without one are skipped by backfill.
    #[serde(default)]
    pub sitemap: Option<String>,
    #[serde(default)]
    pub feeds: Vec<String>,
}

/// Ordered list of publishers. Order defines the backfill cursor's source axis,
/// so reordering the file invalidates the meaning of a persisted cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Validate and wrap an ordered source list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty or duplicated key.
    pub fn new(sources: Vec<SourceConfig>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if source.key.trim().is_empty() {
                return Err(ConfigError::Invalid("source with empty key".to_string()));
            }
            if !seen.insert(source.key.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source key `{}`", source.key)));
            }
        }
        Ok(Self { sources })
    }

    /// Parse a registry document; `path` is only used in error messages.
    pub fn from_yaml(yaml: &str, path: &Path) -> Result<Self, ConfigError> {
        let parsed: SourceRegistry = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(parsed.sources)
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let registry = Self::from_yaml(&yaml, path)?;
        info!(
            sources = registry.len(),
            with_sitemap = registry.sources.iter().filter(|s| s.sitemap.is_some()).count(),
            "Loaded source registry"
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Source at position `idx` of the cursor's source axis.
    pub fn get(&self, idx: usize) -> Option<&SourceConfig> {
        self.sources.get(idx)
    }

    /// Source keys in registry order.
    pub fn keys(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.key.clone()).collect()
    }

    /// Keep only the sources whose key is listed, preserving registry order.
    ///
    /// # Arguments
    ///
    /// * `keys` - Source keys to keep; an empty slice keeps every source
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first key that is not in
    /// the registry.
    pub fn only(self, keys: &[String]) -> Result<Self, ConfigError> {
        if keys.is_empty() {
            return Ok(self);
        }
        if let Some(unknown) = keys.iter().find(|k| !self.sources.iter().any(|s| &s.key == *k)) {
            return Err(ConfigError::Invalid(format!("unknown source key `{unknown}`")));
        }
        Ok(Self {
            sources: self
                .sources
                .into_iter()
                .filter(|s| keys.contains(&s.key))
                .collect(),
        })
    }
}

/// Knobs shared by both run modes.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestSettings {
    pub data_dir: PathBuf,
    /// Items published before this instant are never stored.
    pub floor: DateTime<Utc>,
    /// Soft wall-clock budget for one invocation.
    pub budget: StdDuration,
    /// Margin kept free before an external hard kill.
    pub headroom: StdDuration,
    /// Month-cells processed per backfill invocation.
    pub max_cells: usize,
    /// Committed items between periodic checkpoints.
    pub checkpoint_every: usize,
    pub sitemap_delay: StdDuration,
    pub item_delay: StdDuration,
    pub feed_delay: StdDuration,
    /// Daily mode's sitemap fallback looks this far back.
    pub lookback: StdDuration,
    pub infer_dates: bool,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            floor: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            budget: StdDuration::from_secs(40 * 60),
            headroom: StdDuration::from_secs(120),
            max_cells: 6,
            checkpoint_every: 25,
            sitemap_delay: StdDuration::from_millis(600),
            item_delay: StdDuration::from_millis(180),
            feed_delay: StdDuration::from_millis(250),
            lookback: StdDuration::from_secs(72 * 3600),
            infer_dates: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sources:
  - key: ars_technica
    display_name: Ars Technica
    feeds:
      - https://feeds.arstechnica.com/arstechnica/index
    sitemap: https://arstechnica.com/sitemap.xml
  - key: feeds_only
    display_name: Feeds Only
    feeds: [https://example.org/rss]
  - key: the_verge
    display_name: The Verge
    sitemap: https://www.theverge.com/sitemap.xml
"#;

    #[test]
    fn test_registry_preserves_order_and_defaults() {
        let reg = SourceRegistry::from_yaml(YAML, Path::new("sources.yaml")).unwrap();
        assert_eq!(reg.keys(), vec!["ars_technica", "feeds_only", "the_verge"]);
        assert_eq!(reg.get(1).unwrap().sitemap, None);
        assert!(reg.get(2).unwrap().feeds.is_empty());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_bad_yaml() {
        let dup = "sources:\n  - {key: a, display_name: A}\n  - {key: a, display_name: B}\n";
        assert!(matches!(
            SourceRegistry::from_yaml(dup, Path::new("x")),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SourceRegistry::from_yaml("sources: [", Path::new("x")),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn test_only_filters_in_registry_order() {
        let reg = SourceRegistry::from_yaml(YAML, Path::new("x")).unwrap();
        let picked = reg
            .clone()
            .only(&["the_verge".to_string(), "ars_technica".to_string()])
            .unwrap();
        let keys: Vec<_> = picked.sources.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["ars_technica", "the_verge"]);
        assert!(reg.only(&["nope".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_load_shipped_registry() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("sources.yaml");
        let reg = SourceRegistry::load(&path).await.unwrap();
        assert!(!reg.is_empty());
        assert!(reg.sources.iter().all(|s| !s.display_name.is_empty()));
    }
}
