//! Data models for harvested articles and the values that flow into them.
//!
//! This module defines the core data structures used throughout the application:
//! - [`Item`]: One stored article, exactly as it is written into a monthly shard
//! - [`Candidate`]: A URL discovered by a feed or sitemap, not yet deduplicated
//! - [`Extracted`]: Whatever the content extractor managed to pull from a page
//!
//! Field names of [`Item`] are the on-disk contract read by the static site,
//! which is why optional strings are stored as `""` instead of `null`.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical;

/// A single harvested article.
///
/// An `Item` is created once, when a candidate passes the dedup check, and is
/// never mutated after it has been appended to its shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identity key: hex SHA-1 of the canonical URL.
    pub id: String,
    /// Canonical URL.
    pub url: String,
    pub title: String,
    /// Display name of the publisher.
    pub source: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub content_text: String,
    #[serde(default)]
    pub content_html: String,
    #[serde(default)]
    pub cover_image: String,
    /// Whether the full content may be republished on the site.
    #[serde(default)]
    pub can_publish_fulltext: bool,
}

fn default_lang() -> String {
    "en".to_string()
}

impl Item {
    /// Build a fresh item for `raw_url`, canonicalizing it and deriving the id.
    ///
    /// Empty metadata stays empty; the caller decides on fallbacks.
    pub fn new(raw_url: &str, source: &str, published_at: DateTime<Utc>) -> Self {
        let url = canonical::canonicalize(raw_url);
        Self {
            id: canonical::identity_key(&url),
            url,
            title: String::new(),
            source: source.to_string(),
            published_at,
            updated_at: String::new(),
            author: String::new(),
            summary: String::new(),
            lang: default_lang(),
            content_text: String::new(),
            content_html: String::new(),
            cover_image: String::new(),
            can_publish_fulltext: false,
        }
    }

    /// The (year, month) shard this item belongs to.
    pub fn shard(&self) -> (i32, u32) {
        (self.published_at.year(), self.published_at.month())
    }

    /// True when the item carries readable content.
    pub fn has_content(&self) -> bool {
        !self.content_text.trim().is_empty() || !self.content_html.trim().is_empty()
    }

    /// Merge extractor output into the item.
    ///
    /// Missing title and author are filled in, timestamps and cover image are
    /// overridden when the page provides them, and content always replaces
    /// what was there.
    pub fn apply(&mut self, data: Extracted) {
        if self.title.is_empty() {
            if let Some(title) = data.title.filter(|t| !t.is_empty()) {
                self.title = title;
            }
        }
        if self.author.is_empty() {
            if let Some(author) = data.author.filter(|a| !a.is_empty()) {
                self.author = author;
            }
        }
        if let Some(published_at) = data.published_at {
            self.published_at = published_at;
        }
        if let Some(updated_at) = data.updated_at {
            self.updated_at = updated_at.to_rfc3339();
        }
        if let Some(cover) = data.cover_image.filter(|c| !c.is_empty()) {
            self.cover_image = cover;
        }
        self.content_text = data.content_text.unwrap_or_default();
        self.content_html = data.content_html.unwrap_or_default();
        self.can_publish_fulltext = self.has_content();
    }
}

/// A URL discovered by a feed or a sitemap.
///
/// Feeds carry a bit of metadata; sitemaps only give a location and a
/// (possibly inferred) timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
}

impl Candidate {
    pub fn at(url: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            published_at: Some(published_at),
            ..Self::default()
        }
    }
}

/// Output of the content extractor for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub content_text: Option<String>,
    pub content_html: Option<String>,
    pub cover_image: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_new_item_canonicalizes_url() {
        let item = Item::new("http://www.pub.com/a/?utm_source=x", "Pub", at(2025, 3, 2));
        assert_eq!(item.url, "https://pub.com/a");
        assert_eq!(item.id.len(), 40);
        assert_eq!(item.shard(), (2025, 3));
        assert!(!item.can_publish_fulltext);
    }

    #[test]
    fn test_apply_fills_and_overrides() {
        let mut item = Item::new("https://pub.com/a", "Pub", at(2025, 3, 2));
        item.author = "Feed Author".to_string();
        item.apply(Extracted {
            title: Some("Page Title".to_string()),
            author: Some("Page Author".to_string()),
            published_at: Some(at(2025, 4, 1)),
            content_text: Some("Body".to_string()),
            cover_image: Some("https://pub.com/a.jpg".to_string()),
            ..Extracted::default()
        });

        assert_eq!(item.title, "Page Title");
        assert_eq!(item.author, "Feed Author");
        assert_eq!(item.shard(), (2025, 4));
        assert_eq!(item.cover_image, "https://pub.com/a.jpg");
        assert!(item.can_publish_fulltext);
    }

    #[test]
    fn test_apply_empty_extraction_clears_publish_flag() {
        let mut item = Item::new("https://pub.com/a", "Pub", at(2025, 3, 2));
        item.apply(Extracted::default());
        assert!(!item.can_publish_fulltext);
        assert_eq!(item.published_at, at(2025, 3, 2));
    }

    #[test]
    fn test_item_serialization_uses_site_field_names() {
        let item = Item::new("https://pub.com/a", "Pub", at(2025, 3, 2));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["published_at"], "2025-03-02T12:00:00Z");
        assert_eq!(json["updated_at"], "");
        assert_eq!(json["lang"], "en");
        assert_eq!(json["can_publish_fulltext"], false);
    }

    #[test]
    fn test_item_deserializes_sparse_records() {
        let json = r#"{
            "id": "abc",
            "url": "https://pub.com/a",
            "title": "T",
            "source": "Pub",
            "published_at": "2025-03-02T10:00:00+00:00"
        }"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.shard(), (2025, 3));
        assert_eq!(item.lang, "en");
        assert!(item.content_text.is_empty());
    }
}
