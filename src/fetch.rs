//! HTTP transport with a single retry policy shared by every network call.
//!
//! # Architecture
//!
//! The module uses a trait-based design for flexibility:
//! - [`Fetch`]: Core trait defining an async GET returning the raw body
//! - [`HttpFetcher`]: `reqwest`-backed implementation
//! - [`RetryFetch`]: Decorator that adds retry logic to any `Fetch` implementation
//!
//! # Retry Strategy
//!
//! - Only transient failures are retried: timeouts, connection errors and
//!   HTTP 429/500/502/503/504
//! - Geometric backoff (`base_delay * backoff_factor^(attempt-1)`)
//! - A `Retry-After` hint from the server raises the delay; hints that are
//!   malformed or too large to represent are ignored
//! - Delay capped at `max_delay`, plus random jitter (0-250ms)
//! - After `max_retries` retries the last error is returned and the caller
//!   skips that unit of work

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use rand::{Rng, rng};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, instrument, warn};

/// HTTP statuses worth another attempt.
pub const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

const USER_AGENT: &str = concat!("NewsHarvest/", env!("CARGO_PKG_VERSION"), " (+https://github.com/)");
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors that can occur while fetching a document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<StdDuration>,
    },
    #[error("failed to decompress {url}: {source}")]
    Decompress {
        url: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Status { status, .. } => RETRYABLE_STATUS.contains(status),
            FetchError::Decompress { .. } => false,
        }
    }

    /// Server-supplied `Retry-After` hint, if any.
    pub fn retry_after(&self) -> Option<StdDuration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A successfully fetched document.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    /// Body with gzip transparently removed (sitemaps are often served as `.xml.gz`).
    pub fn decoded(&self) -> Result<Cow<'_, [u8]>, FetchError> {
        decode_body(&self.body).map_err(|source| FetchError::Decompress {
            url: self.url.clone(),
            source,
        })
    }

    /// Body as text, gunzipped if needed, with invalid UTF-8 replaced.
    pub fn text(&self) -> Result<String, FetchError> {
        Ok(String::from_utf8_lossy(&self.decoded()?).into_owned())
    }
}

/// Gunzip `bytes` when they start with the gzip magic number, else borrow them.
pub fn decode_body(bytes: &[u8]) -> io::Result<Cow<'_, [u8]>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(Cow::Owned(out))
}

/// Trait for fetching a document by URL.
///
/// Implementors of this trait perform a single GET. This abstraction allows
/// for different transports or decorators (like retry logic), and lets the
/// crawl engine run against in-memory documents in tests.
pub trait Fetch {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

impl<T: Fetch + ?Sized> Fetch for &T {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        (**self).fetch(url).await
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: StdDuration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/rss+xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.8"));
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                retry_after,
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();
        debug!(bytes = body.len(), ?content_type, "Fetched document");
        Ok(Fetched {
            url: url.to_string(),
            content_type,
            body,
        })
    }
}

/// Parse a `Retry-After` header value.
///
/// # Arguments
///
/// * `raw` - Header value: delta-seconds or an HTTP date
/// * `now` - Reference time for the HTTP-date form
///
/// # Returns
///
/// The wait the server asked for, or `None` when the value is malformed,
/// negative, already past, or does not fit a `Duration`.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<StdDuration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return StdDuration::try_from_secs_f64(secs).ok();
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

/// How failed network calls are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: StdDuration,
    pub backoff_factor: f64,
    pub max_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: StdDuration::from_secs(1),
            backoff_factor: 1.6,
            max_delay: StdDuration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32, hint: Option<StdDuration>) -> StdDuration {
        let exp = attempt.saturating_sub(1) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let mut delay = StdDuration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));
        if let Some(hint) = hint {
            delay = delay.max(hint);
        }
        delay.min(self.max_delay)
    }
}

/// Wrapper that adds retry logic to any [`Fetch`] implementation.
#[derive(Clone)]
pub struct RetryFetch<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Fetch> RetryFetch<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: Fetch> Fetch for RetryFetch<T> {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.inner.fetch(url).await {
                Ok(doc) => return Ok(doc),
                Err(e) => {
                    attempt += 1;
                    let elapsed_ms_total = total_t0.elapsed().as_millis() as u64;

                    if !e.is_transient() {
                        debug!(%url, error = %e, "Non-transient fetch failure; not retrying");
                        return Err(e);
                    }
                    if attempt > self.policy.max_retries {
                        error!(
                            %url,
                            attempt,
                            max = self.policy.max_retries,
                            elapsed_ms_total,
                            error = %e,
                            "fetch() exhausted retries"
                        );
                        return Err(e);
                    }

                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = self.policy.delay_for(attempt, e.retry_after())
                        + StdDuration::from_millis(jitter_ms);
                    warn!(
                        %url,
                        attempt,
                        max = self.policy.max_retries,
                        elapsed_ms_total,
                        ?delay,
                        error = %e,
                        "fetch() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory transport for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Page {
        body: Vec<u8>,
        content_type: String,
    }

    /// Serves canned documents; unknown URLs answer 404. Records every request.
    #[derive(Default)]
    pub struct StaticFetcher {
        pages: HashMap<String, Page>,
        failures: Mutex<HashMap<String, (u16, usize)>>,
        requests: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_xml(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.with_page(url, body, "application/xml")
        }

        pub fn with_html(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.with_page(url, body, "text/html; charset=utf-8")
        }

        pub fn with_page(mut self, url: &str, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                Page {
                    body: body.into(),
                    content_type: content_type.to_string(),
                },
            );
            self
        }

        /// Answer `status` for the next `times` requests to `url`.
        pub fn with_failures(self, url: &str, status: u16, times: usize) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, times));
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        pub fn request_count(&self, url: &str) -> usize {
            self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    impl Fetch for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            if let Some((status, remaining)) = self.failures.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: *status,
                        retry_after: None,
                    });
                }
            }
            match self.pages.get(url) {
                Some(page) => Ok(Fetched {
                    url: url.to_string(),
                    content_type: Some(page.content_type.clone()),
                    body: page.body.clone(),
                }),
                None => Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                    retry_after: None,
                }),
            }
        }
    }
}
