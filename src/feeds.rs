//! RSS 2.0 and Atom feed reader.
//!
//! Feeds are the daily mode's primary source of candidates. Each `<item>` or
//! `<entry>` becomes a [`Candidate`] carrying whatever metadata the feed
//! offers; entries without a usable link are dropped.

use itertools::Itertools;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

use crate::fetch::{Fetch, FetchError};
use crate::models::Candidate;
use crate::utils::parse_timestamp;
use crate::xml::{append_text, attribute, local_name};

/// Why a feed produced no candidates.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed: {0}")]
    Parse(#[from] quick_xml::Error),
}

/// Raw fields of one `<item>` / `<entry>`.
#[derive(Debug, Default)]
struct EntryFields {
    link: Option<String>,
    guid: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    author: Option<String>,
}

impl EntryFields {
    fn set(slot: &mut Option<String>, value: &str) {
        let value = value.trim();
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    fn into_candidate(self, base: Option<&Url>) -> Option<Candidate> {
        let raw = self
            .link
            .or_else(|| self.guid.filter(|g| g.starts_with("http://") || g.starts_with("https://")))?;
        let url = match base.and_then(|b| b.join(&raw).ok()) {
            Some(resolved) => resolved.to_string(),
            None => raw,
        };
        let published_at = self
            .published
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.updated.as_deref().and_then(parse_timestamp));
        Some(Candidate {
            url,
            published_at,
            title: self.title,
            summary: self.summary,
            author: self.author,
        })
    }
}

/// Parse an RSS or Atom document into candidates, in document order.
///
/// Relative links are resolved against `base` when given. Duplicate links
/// within the same feed are collapsed to their first occurrence.
pub fn parse_feed(xml: &[u8], base: Option<&Url>) -> Result<Vec<Candidate>, quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<EntryFields> = None;
    let mut entries = Vec::new();
    let mut text = String::new();

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Start(e) => {
                let name = local_name(e.local_name());
                if name == "item" || name == "entry" {
                    current = Some(EntryFields::default());
                } else if let Some(fields) = current.as_mut() {
                    if name == "link" {
                        take_atom_link(fields, e);
                    }
                }
                stack.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                if let Some(fields) = current.as_mut() {
                    if local_name(e.local_name()) == "link" {
                        take_atom_link(fields, e);
                    }
                }
            }
            Event::End(_) => {
                let name = stack.pop().unwrap_or_default();
                let parent = stack.last().map(String::as_str).unwrap_or_default();
                if name == "item" || name == "entry" {
                    if let Some(fields) = current.take() {
                        entries.push(fields);
                    }
                } else if let Some(fields) = current.as_mut() {
                    let in_entry = parent == "item" || parent == "entry";
                    match name.as_str() {
                        "link" if in_entry => EntryFields::set(&mut fields.link, &text),
                        "guid" | "id" if in_entry => EntryFields::set(&mut fields.guid, &text),
                        "title" if in_entry => EntryFields::set(&mut fields.title, &text),
                        "description" | "summary" if in_entry => EntryFields::set(&mut fields.summary, &text),
                        "pubdate" | "published" | "date" | "issued" if in_entry => {
                            EntryFields::set(&mut fields.published, &text)
                        }
                        "updated" | "modified" if in_entry => EntryFields::set(&mut fields.updated, &text),
                        "author" | "creator" if in_entry => EntryFields::set(&mut fields.author, &text),
                        "name" if parent == "author" => EntryFields::set(&mut fields.author, &text),
                        _ => {}
                    }
                }
                text.clear();
            }
            Event::Eof => break,
            other => {
                append_text(other, &mut text);
            }
        }
        buf.clear();
    }

    Ok(entries
        .into_iter()
        .filter_map(|fields| fields.into_candidate(base))
        .unique_by(|c| c.url.clone())
        .collect())
}

/// Atom links live in the `href` attribute; prefer `rel="alternate"` (or no rel).
fn take_atom_link(fields: &mut EntryFields, element: &BytesStart<'_>) {
    let Some(href) = attribute(element, "href") else {
        return;
    };
    let rel = attribute(element, "rel");
    if matches!(rel.as_deref(), None | Some("alternate")) {
        EntryFields::set(&mut fields.link, &href);
    }
}

/// Fetches and parses feeds through any [`Fetch`] transport.
#[derive(Debug, Clone)]
pub struct FeedReader<F> {
    fetcher: F,
}

impl<F: Fetch> FeedReader<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    #[instrument(level = "info", skip(self))]
    pub async fn read(&self, feed_url: &str) -> Result<Vec<Candidate>, FeedError> {
        let fetched = self.fetcher.fetch(feed_url).await?;
        let body = fetched.decoded()?;
        let base = Url::parse(feed_url).ok();
        let entries = parse_feed(&body, base.as_ref())?;
        info!(count = entries.len(), "Read feed entries");
        Ok(entries)
    }
}
