//! Utility functions for timestamps, calendar months, logging and file system checks.
//!
//! This module provides helper functions used throughout the application:
//! - Lenient timestamp parsing for feeds, sitemaps and HTML metadata
//! - Calendar month arithmetic for the backfill cursor
//! - String truncation for log output
//! - File system validation for the data directory

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use std::fs as stdfs;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

/// Offset-carrying formats seen in the wild besides strict RFC 3339/2822.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S%z",
];

/// Naive formats, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%MZ",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a timestamp from a feed, sitemap or HTML meta tag and normalize it to UTC.
///
/// Accepts RFC 3339, RFC 2822, the W3C datetime profile used by sitemaps
/// (including minute precision and bare dates) and naive datetimes, which are
/// assumed to be UTC. Returns `None` for anything else.
///
/// # Examples
///
/// ```ignore
/// assert!(parse_timestamp("2025-03-02T10:00:00Z").is_some());
/// assert!(parse_timestamp("Sun, 02 Mar 2025 10:00:00 GMT").is_some());
/// assert!(parse_timestamp("yesterday").is_none());
/// ```
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// First instant of a calendar month, or `None` for an invalid month.
pub fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// The calendar month after `(year, month)`.
pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 { (year + 1, 1) } else { (year, month + 1) }
}

/// All calendar months touched by the inclusive window `[start, end]`, oldest first.
///
/// An inverted window yields no months.
pub fn months_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    if end < start {
        return months;
    }
    let mut cursor = (start.year(), start.month());
    let last = (end.year(), end.month());
    while cursor <= last {
        months.push(cursor);
        cursor = next_month(cursor.0, cursor.1);
    }
    months
}

/// The part of `[start, end]` that falls inside `(year, month)`, as an inclusive range.
pub fn month_window(
    year: i32,
    month: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = month_start(year, month)?;
    let (ny, nm) = next_month(year, month);
    let last = month_start(ny, nm)? - TimeDelta::nanoseconds(1);
    let lo = first.max(start);
    let hi = last.min(end);
    (lo <= hi).then_some((lo, hi))
}

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` bytes (backing off to a char boundary)
/// with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log("a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Ensure a directory exists and is writable.
///
/// This function creates the directory if it doesn't exist, then performs
/// a write test by creating and immediately deleting a probe file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path).await?;
    // Try a small sync write using std fs (simpler error surface)
    let probe_path = path.join("..__probe_write__");
    stdfs::File::create(&probe_path)?;
    let _ = stdfs::remove_file(&probe_path);
    info!("Data directory is writable");
    Ok(())
}
