//! Sitemap window collector.
//!
//! Given a root sitemap (a plain `<urlset>` or a `<sitemapindex>`, possibly
//! gzip-compressed and possibly nested) and an inclusive time window, produce
//! the article URLs whose timestamp falls inside the window.
//!
//! # Algorithm
//!
//! 1. Fetch the root. For an index, keep children whose `<lastmod>` lies
//!    within 40 days of the window (children without `<lastmod>` are kept).
//!    A leaf root is its own sole child.
//! 2. For each child, after the politeness delay, read its `<url>` entries.
//!    An entry is kept with its `<lastmod>` when that falls in the window;
//!    otherwise, if inference is enabled, a `/YYYY/MM[/DD]` pattern in the
//!    URL gives an approximate timestamp (mid-month when the day is missing).
//! 3. Children that fail to fetch or parse are logged and skipped.
//! 4. Once the optional deadline passes, no further child is requested and
//!    whatever was collected so far is returned.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration as StdDuration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use crate::fetch::Fetch;
use crate::models::Candidate;
use crate::utils::parse_timestamp;
use crate::xml::{append_text, local_name};

/// Slack applied to a child sitemap's `<lastmod>` before skipping it.
const CHILD_LASTMOD_SLACK_DAYS: i64 = 40;
/// Nested indexes deeper than this are not expanded.
const MAX_INDEX_DEPTH: usize = 3;
/// Day assumed when a URL path only carries year and month.
const INFERRED_DAY: u32 = 15;

static PATH_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(20\d{2})[-/](\d{1,2})(?:[-/](\d{1,2}))?(?:[^\d]|$)").expect("static regex")
});

/// One `<url>` or `<sitemap>` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
}

/// A parsed sitemap document.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SitemapDoc {
    /// Child sitemaps (non-empty for a sitemap index).
    pub sitemaps: Vec<SitemapEntry>,
    /// Article URLs (non-empty for a leaf sitemap).
    pub urls: Vec<SitemapEntry>,
}

impl SitemapDoc {
    pub fn is_index(&self) -> bool {
        !self.sitemaps.is_empty()
    }
}

/// Parse a sitemap or sitemap index, ignoring namespaces.
///
/// Only `<loc>`/`<lastmod>` elements that are direct children of `<url>` or
/// `<sitemap>` count, so `<image:loc>` and friends are ignored.
pub fn parse_sitemap(xml: &[u8]) -> Result<SitemapDoc, quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut doc = SitemapDoc::default();
    let mut stack: Vec<String> = Vec::new();
    let mut entry: Option<SitemapEntry> = None;
    let mut text = String::new();

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Start(e) => {
                let name = local_name(e.local_name());
                if (name == "url" || name == "sitemap") && entry.is_none() {
                    entry = Some(SitemapEntry {
                        loc: String::new(),
                        lastmod: None,
                    });
                }
                stack.push(name);
                text.clear();
            }
            Event::End(_) => {
                let name = stack.pop().unwrap_or_default();
                let field_of_entry = matches!(stack.last().map(String::as_str), Some("url" | "sitemap"));
                match name.as_str() {
                    "loc" if field_of_entry => {
                        if let Some(current) = entry.as_mut() {
                            current.loc = text.trim().to_string();
                        }
                    }
                    "lastmod" if field_of_entry => {
                        if let Some(current) = entry.as_mut() {
                            let value = text.trim();
                            current.lastmod = (!value.is_empty()).then(|| value.to_string());
                        }
                    }
                    "url" | "sitemap" => {
                        if let Some(done) = entry.take().filter(|e| !e.loc.is_empty()) {
                            if name == "url" {
                                doc.urls.push(done);
                            } else {
                                doc.sitemaps.push(done);
                            }
                        }
                    }
                    _ => {}
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
    Ok(doc)
}

/// Approximate publication time from a `/YYYY/MM[/DD]` pattern in the URL.
///
/// A missing day defaults to the 15th; impossible dates yield `None`.
pub fn infer_date_from_url(url: &str) -> Option<DateTime<Utc>> {
    let caps = PATH_DATE.captures(url)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = match caps.get(3) {
        Some(d) => d.as_str().parse().ok()?,
        None => INFERRED_DAY,
    };
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single()
}

/// Coarse pre-filter for a child sitemap of an index.
pub fn child_in_range(lastmod: Option<&str>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    let Some(lastmod) = lastmod.and_then(parse_timestamp) else {
        return true;
    };
    let slack = TimeDelta::days(CHILD_LASTMOD_SLACK_DAYS);
    lastmod >= start - slack && lastmod <= end + slack
}

/// Tuning for one collector.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectOptions {
    /// Pause before each child sitemap request.
    pub polite_delay: StdDuration,
    /// Infer timestamps from URL paths when `<lastmod>` is missing or out of window.
    pub infer_dates: bool,
    /// Stop requesting children once this instant has passed.
    pub deadline: Option<Instant>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            polite_delay: StdDuration::from_millis(600),
            infer_dates: true,
            deadline: None,
        }
    }
}

/// Walks a sitemap tree and yields in-window candidates.
#[derive(Debug, Clone)]
pub struct SitemapCollector<F> {
    fetcher: F,
    options: CollectOptions,
}

impl<F: Fetch> SitemapCollector<F> {
    pub fn new(fetcher: F, options: CollectOptions) -> Self {
        Self { fetcher, options }
    }

    /// Collect `(url, timestamp)` candidates inside `[start, end]`, deduplicated by URL.
    ///
    /// Never fails: a root that cannot be fetched or parsed yields no
    /// candidates, and broken children are skipped.
    #[instrument(level = "info", skip(self, start, end), fields(%start, %end))]
    pub async fn collect(
        &self,
        root_url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let root = match self.fetch_doc(root_url).await {
            Some(doc) => doc,
            None => return Vec::new(),
        };

        let mut results = Vec::new();
        let mut seen_urls = HashSet::new();
        let mut visited = HashSet::from([root_url.to_string()]);
        let mut queue = VecDeque::new();

        if root.is_index() {
            self.enqueue_children(&root, 1, start, end, &mut visited, &mut queue);
        } else {
            self.keep_in_window(&root, start, end, &mut seen_urls, &mut results);
        }

        while let Some((child, depth)) = queue.pop_front() {
            if self.options.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    root = %root_url,
                    pending = queue.len() + 1,
                    "Deadline reached; returning partial sitemap results"
                );
                break;
            }
            sleep(self.options.polite_delay).await;
            let Some(doc) = self.fetch_doc(&child).await else {
                continue;
            };
            if doc.is_index() {
                if depth < MAX_INDEX_DEPTH {
                    self.enqueue_children(&doc, depth + 1, start, end, &mut visited, &mut queue);
                } else {
                    warn!(%child, depth, "Sitemap nesting too deep; not expanding");
                }
            }
            self.keep_in_window(&doc, start, end, &mut seen_urls, &mut results);
        }

        info!(root = %root_url, count = results.len(), "Collected sitemap URLs in window");
        results
    }

    async fn fetch_doc(&self, url: &str) -> Option<SitemapDoc> {
        let fetched = match self.fetcher.fetch(url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(%url, error = %e, "Sitemap fetch failed; skipping");
                return None;
            }
        };
        let body = match fetched.decoded() {
            Ok(body) => body,
            Err(e) => {
                warn!(%url, error = %e, "Sitemap decompression failed; skipping");
                return None;
            }
        };
        match parse_sitemap(&body) {
            Ok(doc) => {
                debug!(%url, children = doc.sitemaps.len(), urls = doc.urls.len(), "Parsed sitemap");
                Some(doc)
            }
            Err(e) => {
                warn!(%url, error = %e, "Sitemap parse failed; skipping");
                None
            }
        }
    }

    fn enqueue_children(
        &self,
        index: &SitemapDoc,
        depth: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        visited: &mut HashSet<String>,
        queue: &mut VecDeque<(String, usize)>,
    ) {
        let mut skipped = 0usize;
        for child in &index.sitemaps {
            if !child_in_range(child.lastmod.as_deref(), start, end) {
                skipped += 1;
                continue;
            }
            if visited.insert(child.loc.clone()) {
                queue.push_back((child.loc.clone(), depth));
            }
        }
        debug!(total = index.sitemaps.len(), skipped, depth, "Filtered child sitemaps");
    }

    fn keep_in_window(
        &self,
        doc: &SitemapDoc,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        seen: &mut HashSet<String>,
        results: &mut Vec<Candidate>,
    ) {
        let in_window = |dt: &DateTime<Utc>| *dt >= start && *dt <= end;
        for entry in &doc.urls {
            if seen.contains(&entry.loc) {
                continue;
            }
            let explicit = entry
                .lastmod
                .as_deref()
                .and_then(parse_timestamp)
                .filter(in_window);
            let used = explicit.or_else(|| {
                self.options
                    .infer_dates
                    .then(|| infer_date_from_url(&entry.loc))
                    .flatten()
                    .filter(in_window)
            });
            if let Some(at) = used {
                seen.insert(entry.loc.clone());
                results.push(Candidate::at(entry.loc.clone(), at));
            }
        }
    }
}
