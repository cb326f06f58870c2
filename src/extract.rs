//! Article content extraction.
//!
//! The crawl engine asks a [`ContentExtractor`] to enrich each new item. The
//! production implementation, [`HtmlExtractor`], downloads the page through
//! the shared retrying transport and reads metadata and article text with
//! `scraper`. It never bypasses paywalls: whatever the public HTML contains is
//! all it sees.
//!
//! Metadata is read from, in order of preference:
//! - OpenGraph / Twitter / article meta tags
//! - JSON-LD (`datePublished`, `dateModified`, `author.name`, `headline`)
//! - Plain HTML (`<title>`, `<time datetime>`, the first `<img>`)
//!
//! Article markup is republished by the static site, so it is sanitized with
//! `ammonia` before it is stored: scripts, styles, frames and event handler
//! attributes are dropped and relative links and images are made absolute.

use ammonia::UrlRelative;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument};
use url::Url;

use crate::fetch::{Fetch, FetchError};
use crate::models::Extracted;
use crate::utils::parse_timestamp;

static META: Lazy<Selector> = Lazy::new(|| selector("meta[content]"));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static JSON_LD: Lazy<Selector> = Lazy::new(|| selector(r#"script[type="application/ld+json"]"#));
static TIME: Lazy<Selector> = Lazy::new(|| selector("time[datetime]"));
static ARTICLE: Lazy<Selector> = Lazy::new(|| selector(r#"article, [itemprop="articleBody"]"#));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| selector("p"));
static IMAGE: Lazy<Selector> = Lazy::new(|| selector("img[src]"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

const TITLE_KEYS: &[&str] = &["og:title", "twitter:title"];
const AUTHOR_KEYS: &[&str] = &["author", "byl", "byline", "article:author", "parsely-author", "dc.creator"];
const PUBLISHED_KEYS: &[&str] = &[
    "article:published_time",
    "og:published_time",
    "datepublished",
    "pubdate",
    "publishdate",
    "date",
    "dc.date",
];
const UPDATED_KEYS: &[&str] = &["article:modified_time", "og:updated_time", "datemodified", "last-modified"];
const IMAGE_KEYS: &[&str] = &["og:image", "og:image:url", "twitter:image"];

/// Anything that can enrich an article from its URL.
///
/// `Ok(None)` means the page had nothing to offer (e.g. it was not HTML).
/// Errors are never fatal to a run; callers keep the item as it was.
pub trait ContentExtractor {
    async fn extract(&self, url: &str) -> Result<Option<Extracted>, FetchError>;
}

impl<T: ContentExtractor + ?Sized> ContentExtractor for &T {
    async fn extract(&self, url: &str) -> Result<Option<Extracted>, FetchError> {
        (**self).extract(url).await
    }
}

/// Fetches a page and scrapes it with [`parse_article`].
#[derive(Debug, Clone)]
pub struct HtmlExtractor<F> {
    fetcher: F,
}

impl<F: Fetch> HtmlExtractor<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetch> ContentExtractor for HtmlExtractor<F> {
    #[instrument(level = "debug", skip(self))]
    async fn extract(&self, url: &str) -> Result<Option<Extracted>, FetchError> {
        let page = self.fetcher.fetch(url).await?;
        if !page.is_html() {
            debug!(content_type = ?page.content_type, "Not an HTML page; nothing to extract");
            return Ok(None);
        }
        let html = page.text()?;
        Ok(Some(parse_article(&html, url)))
    }
}

/// Scrape metadata and article content out of an HTML document.
pub fn parse_article(html: &str, page_url: &str) -> Extracted {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let metas = meta_map(&document);
    let ld = json_ld(&document);
    let lookup = |keys: &[&str]| keys.iter().find_map(|k| metas.get(*k).cloned());

    let title = lookup(TITLE_KEYS)
        .or_else(|| ld.get("headline").cloned())
        .or_else(|| {
            document
                .select(&TITLE)
                .next()
                .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        })
        .filter(|t| !t.is_empty());

    let author = AUTHOR_KEYS
        .iter()
        .filter_map(|k| metas.get(*k))
        .find(|v| !v.starts_with("http://") && !v.starts_with("https://"))
        .cloned()
        .or_else(|| ld.get("author").cloned())
        .map(|a| clean_author(&a))
        .filter(|a| !a.is_empty());

    let published_at = lookup(PUBLISHED_KEYS)
        .or_else(|| ld.get("datePublished").cloned())
        .or_else(|| {
            document
                .select(&TIME)
                .next()
                .and_then(|t| t.value().attr("datetime"))
                .map(str::to_string)
        })
        .as_deref()
        .and_then(parse_timestamp);

    let updated_at = lookup(UPDATED_KEYS)
        .or_else(|| ld.get("dateModified").cloned())
        .as_deref()
        .and_then(parse_timestamp);

    let article = document.select(&ARTICLE).next();
    let content_text = article.map(article_text).filter(|t| !t.is_empty());
    let content_html = article
        .map(|a| clean_content_html(&a.inner_html(), base.as_ref()))
        .filter(|h| !h.is_empty());

    let cover_image = lookup(IMAGE_KEYS)
        .or_else(|| {
            article
                .and_then(|a| a.select(&IMAGE).next())
                .or_else(|| document.select(&IMAGE).next())
                .and_then(|img| img.value().attr("src"))
                .map(str::to_string)
        })
        .map(|src| absolutize(base.as_ref(), &src));

    Extracted {
        title,
        author,
        published_at,
        updated_at,
        content_text,
        content_html,
        cover_image,
    }
}

/// `<meta>` content keyed by lowercased `property`, `name` or `itemprop`; first wins.
fn meta_map(document: &Html) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for meta in document.select(&META) {
        let el = meta.value();
        let Some(key) = el
            .attr("property")
            .or_else(|| el.attr("name"))
            .or_else(|| el.attr("itemprop"))
        else {
            continue;
        };
        let value = el.attr("content").unwrap_or_default().trim();
        if !value.is_empty() {
            out.entry(key.trim().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

/// Flatten every JSON-LD block into `key -> string`; first value wins.
///
/// Nested objects contribute their `name` (so `author: {name}` becomes
/// `author`), arrays of authors are joined with ", ", and `@graph` arrays are
/// walked.
fn json_ld(document: &Html) -> HashMap<String, String> {
    let mut data = HashMap::new();
    for script in document.select(&JSON_LD) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => flatten_json_ld(&value, &mut data),
            Err(e) => debug!(error = %e, "Ignoring malformed JSON-LD block"),
        }
    }
    data
}

fn flatten_json_ld(value: &Value, data: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                match val {
                    Value::String(s) => {
                        data.entry(key.clone()).or_insert_with(|| s.trim().to_string());
                    }
                    Value::Object(nested) => {
                        if let Some(name) = nested.get("name").and_then(Value::as_str) {
                            data.entry(key.clone()).or_insert_with(|| name.trim().to_string());
                        }
                    }
                    Value::Array(items) if key == "author" => {
                        let names: Vec<&str> = items
                            .iter()
                            .filter_map(|a| a.get("name").and_then(Value::as_str).or_else(|| a.as_str()))
                            .collect();
                        if !names.is_empty() {
                            data.entry(key.clone()).or_insert_with(|| names.join(", "));
                        }
                    }
                    Value::Array(items) => {
                        for item in items {
                            flatten_json_ld(item, data);
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_json_ld(item, data);
            }
        }
        _ => {}
    }
}

fn article_text(article: ElementRef<'_>) -> String {
    article
        .select(&PARAGRAPH)
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip a leading "By " byline prefix.
fn clean_author(raw: &str) -> String {
    let trimmed = collapse_whitespace(raw);
    match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("by ") => trimmed[3..].trim().to_string(),
        _ => trimmed,
    }
}

/// Sanitize article markup for republishing.
///
/// Keeps ammonia's default safe tag set (paragraphs, headings, lists,
/// figures, images, links). `<script>`, `<style>`, `<noscript>` and
/// `<iframe>` are removed together with their content, and every `on*`
/// attribute is dropped. With a `base`, relative `href`/`src` values are
/// resolved against it.
pub fn clean_content_html(html: &str, base: Option<&Url>) -> String {
    let mut cleaner = ammonia::Builder::default();
    cleaner.add_clean_content_tags(["noscript", "iframe"]);
    if let Some(base) = base {
        cleaner.url_relative(UrlRelative::RewriteWithBase(base.clone()));
    }
    cleaner.clean(html).to_string().trim().to_string()
}

fn absolutize(base: Option<&Url>, src: &str) -> String {
    base.and_then(|b| b.join(src.trim()).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| src.trim().to_string())
}

#[cfg(test)]
pub mod testing {
    //! Scripted extractor for engine tests.

    use super::*;
    use std::sync::Mutex;

    enum Script {
        Page(Extracted),
        Fail,
    }

    /// Returns canned results per URL; unknown URLs yield `Ok(None)`.
    #[derive(Default)]
    pub struct ScriptedExtractor {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExtractor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_page(mut self, url: &str, data: Extracted) -> Self {
            self.scripts.insert(url.to_string(), Script::Page(data));
            self
        }

        pub fn failing(mut self, url: &str) -> Self {
            self.scripts.insert(url.to_string(), Script::Fail);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ContentExtractor for ScriptedExtractor {
        async fn extract(&self, url: &str) -> Result<Option<Extracted>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.scripts.get(url) {
                Some(Script::Page(data)) => Ok(Some(data.clone())),
                Some(Script::Fail) => Err(FetchError::Status {
                    url: url.to_string(),
                    status: 503,
                    retry_after: None,
                }),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::StaticFetcher;
    use chrono::{TimeZone, Utc};

    const PAGE: &str = r#"<!doctype html>
<html><head>
  <title>Fallback title | Pub</title>
  <meta property="og:title" content="The Real Headline">
  <meta name="byl" content="By Ada Writer">
  <meta property="article:author" content="https://pub.com/people/ada">
  <meta property="article:published_time" content="2025-03-02T10:00:00Z">
  <meta property="og:image" content="/img/cover.jpg">
  <script type="application/ld+json">
    {"@type": "NewsArticle", "dateModified": "2025-03-03T08:00:00+01:00",
     "author": [{"@type": "Person", "name": "Ignored"}]}
  </script>
</head>
<body>
  <nav><p>Menu</p></nav>
  <article>
    <h1>The Real Headline</h1>
    <p>First   paragraph.</p>
    <p></p>
    <p>Second <a href="/x">paragraph</a>.</p>
  </article>
</body></html>"#;

    #[test]
    fn test_parse_article_metadata_and_text() {
        let data = parse_article(PAGE, "https://pub.com/2025/03/story");
        assert_eq!(data.title.as_deref(), Some("The Real Headline"));
        assert_eq!(data.author.as_deref(), Some("Ada Writer"));
        assert_eq!(data.published_at, Some(Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap()));
        assert_eq!(data.updated_at, Some(Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap()));
        assert_eq!(data.cover_image.as_deref(), Some("https://pub.com/img/cover.jpg"));
        assert_eq!(data.content_text.as_deref(), Some("First paragraph.\n\nSecond paragraph."));
        assert!(data.content_html.unwrap().contains("<h1>The Real Headline</h1>"));
    }

    #[test]
    fn test_parse_article_json_ld_and_html_fallbacks() {
        let html = r#"<html><head><title> Plain
            Title </title>
          <script type="application/ld+json">
            {"@graph": [{"@type": "WebPage"},
                        {"@type": "Article", "datePublished": "2025-05-01", "author": {"name": "by Bo Byline"}}]}
          </script></head>
          <body><img src="https://cdn.pub.com/first.png"><div>No article element</div></body></html>"#;
        let data = parse_article(html, "https://pub.com/a");
        assert_eq!(data.title.as_deref(), Some("Plain Title"));
        assert_eq!(data.author.as_deref(), Some("Bo Byline"));
        assert_eq!(data.published_at, Some(Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()));
        assert_eq!(data.cover_image.as_deref(), Some("https://cdn.pub.com/first.png"));
        assert_eq!(data.content_text, None);
        assert_eq!(data.content_html, None);
    }

    #[test]
    fn test_article_html_is_sanitized_and_absolute() {
        let html = r#"<html><body><article>
            <script>alert(document.cookie)</script>
            <style>p { display: none }</style>
            <noscript><img src="/tracker.gif"></noscript>
            <iframe src="https://ads.example/frame">fallback</iframe>
            <p onclick="steal()">Body text</p>
            <figure><img src="/img/a.jpg" alt="A" onerror="steal()"><figcaption>Cap</figcaption></figure>
            <a href="../other" onmouseover="steal()">More</a>
            <a href="javascript:steal()">Bad link</a>
        </article></body></html>"#;
        let data = parse_article(html, "https://pub.com/news/story");
        let clean = data.content_html.unwrap();

        for banned in ["<script", "alert(", "<style", "<noscript", "tracker.gif", "<iframe", "fallback", "onclick", "onerror", "onmouseover", "javascript:"] {
            assert!(!clean.contains(banned), "{banned} survived in {clean}");
        }
        assert!(clean.contains("<p>Body text</p>"));
        assert!(clean.contains(r#"src="https://pub.com/img/a.jpg""#));
        assert!(clean.contains("<figcaption>Cap</figcaption>"));
        assert!(clean.contains(r#"href="https://pub.com/other""#));
        assert_eq!(data.content_text.as_deref(), Some("Body text"));
    }

    #[test]
    fn test_clean_content_html_without_base_keeps_relative_urls() {
        let clean = clean_content_html(r#"<p>Hi <img src="/a.png"></p><script>x()</script>"#, None);
        assert_eq!(clean, r#"<p>Hi <img src="/a.png"></p>"#);
    }

    #[test]
    fn test_clean_author() {
        assert_eq!(clean_author("By  Ada Writer"), "Ada Writer");
        assert_eq!(clean_author("BY ADA"), "ADA");
        assert_eq!(clean_author("Byron Smith"), "Byron Smith");
        assert_eq!(clean_author("Bö"), "Bö");
    }

    #[tokio::test]
    async fn test_html_extractor_skips_non_html() {
        let fetcher = StaticFetcher::new()
            .with_html("https://pub.com/a", PAGE)
            .with_page("https://pub.com/report.pdf", "%PDF", "application/pdf");
        let extractor = HtmlExtractor::new(&fetcher);

        let page = extractor.extract("https://pub.com/a").await.unwrap().unwrap();
        assert_eq!(page.title.as_deref(), Some("The Real Headline"));
        assert_eq!(extractor.extract("https://pub.com/report.pdf").await.unwrap(), None);
        assert!(extractor.extract("https://pub.com/gone").await.is_err());
    }
}
