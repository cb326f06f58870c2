//! Command-line interface definitions for News Harvest.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every knob can be provided via a command-line flag or an environment
//! variable; they are read once here and turned into a
//! [`HarvestSettings`](crate::config::HarvestSettings) value.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use crate::config::HarvestSettings;
use crate::fetch::RetryPolicy;
use crate::utils::parse_timestamp;

/// Command-line arguments for the News Harvest application.
///
/// # Examples
///
/// ```sh
/// # Incremental run from feeds, sitemap fallback over the last 72 hours
/// news_harvest daily
///
/// # Resumable backfill of 2025, six month-cells per invocation
/// news_harvest backfill --start 2025-01-01 --end 2025-12-31T23:59:59Z --max-cells 6
///
/// # Commit the data directory at every checkpoint
/// PUBLISH_COMMAND='git add data && git commit -qm "$HARVEST_MESSAGE" && git push -q' news_harvest backfill
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding shards and state files
    #[arg(long, global = true, env = "HARVEST_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Source registry (YAML)
    #[arg(long, global = true, env = "HARVEST_SOURCES", default_value = "sources.yaml")]
    pub sources: PathBuf,

    /// Restrict the run to these source keys (comma separated)
    #[arg(long, global = true, env = "HARVEST_ONLY", value_delimiter = ',')]
    pub only: Vec<String>,

    /// Earliest publication time ever stored
    #[arg(long, global = true, env = "HARVEST_FLOOR", default_value = "2025-01-01T00:00:00Z", value_parser = parse_cli_timestamp)]
    pub floor: DateTime<Utc>,

    /// Soft time budget per invocation, in minutes
    #[arg(long, global = true, env = "TIME_BUDGET_MINUTES", default_value_t = 40)]
    pub budget_minutes: u64,

    /// Seconds subtracted from the budget as a safety margin
    #[arg(long, global = true, env = "TIME_HEADROOM_SECS", default_value_t = 120)]
    pub headroom_secs: u64,

    /// Checkpoint after this many newly added items
    #[arg(long, global = true, env = "CHECKPOINT_EVERY", default_value_t = 25, value_parser = clap::value_parser!(u64).range(1..))]
    pub checkpoint_every: u64,

    /// Pause before each child sitemap request, in seconds (millisecond precision)
    #[arg(long, global = true, env = "SITEMAP_DELAY", default_value = "0.6", value_parser = parse_seconds)]
    pub sitemap_delay: StdDuration,

    /// Pause after each processed article, in seconds
    #[arg(long, global = true, env = "ITEM_DELAY", default_value = "0.18", value_parser = parse_seconds)]
    pub item_delay: StdDuration,

    /// Pause after each feed, in seconds
    #[arg(long, global = true, env = "FEED_DELAY", default_value = "0.25", value_parser = parse_seconds)]
    pub feed_delay: StdDuration,

    /// Infer publication dates from /YYYY/MM[/DD]/ URL paths when sitemaps omit them
    #[arg(long, global = true, env = "INFER_DATES", default_value_t = true, action = ArgAction::Set)]
    pub infer_dates: bool,

    /// Shell command run at every checkpoint (optional)
    #[arg(long, global = true, env = "PUBLISH_COMMAND")]
    pub publish_command: Option<String>,

    /// HTTP request timeout, in seconds
    #[arg(long, global = true, env = "HTTP_TIMEOUT_SECS", default_value = "60", value_parser = parse_seconds)]
    pub http_timeout: StdDuration,

    /// Retries after a transient HTTP failure
    #[arg(long, global = true, env = "HTTP_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Incremental pass over feeds with a sitemap fallback
    Daily(DailyArgs),
    /// Resumable historical crawl over sitemaps
    Backfill(BackfillArgs),
    /// Drop items without content and rebuild the dedup index
    Prune,
    /// Rebuild index.json from the shards on disk
    Reindex,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct DailyArgs {
    /// Sitemap fallback window, in hours before now
    #[arg(long, env = "SITEMAP_LOOKBACK_HOURS", default_value_t = 72)]
    pub lookback_hours: u64,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct BackfillArgs {
    /// Window start; defaults to the persisted window, else the floor
    #[arg(long, env = "BACKFILL_START", value_parser = parse_cli_timestamp)]
    pub start: Option<DateTime<Utc>>,

    /// Window end; defaults to the persisted window, else now. A bare
    /// YYYY-MM-DD date means the end of that day (UTC)
    #[arg(long, env = "BACKFILL_END", value_parser = parse_cli_end_timestamp)]
    pub end: Option<DateTime<Utc>>,

    /// Month-cells processed per invocation
    #[arg(long, env = "MAX_CELLS_PER_RUN", default_value_t = 6, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_cells: u64,
}

impl Cli {
    /// Collect every crawl knob into one settings value.
    pub fn settings(&self) -> HarvestSettings {
        let mut settings = HarvestSettings {
            data_dir: self.data_dir.clone(),
            floor: self.floor,
            budget: StdDuration::from_secs(self.budget_minutes.saturating_mul(60)),
            headroom: StdDuration::from_secs(self.headroom_secs),
            checkpoint_every: self.checkpoint_every as usize,
            sitemap_delay: self.sitemap_delay,
            item_delay: self.item_delay,
            feed_delay: self.feed_delay,
            infer_dates: self.infer_dates,
            ..HarvestSettings::default()
        };
        match &self.command {
            Command::Daily(args) => {
                settings.lookback = StdDuration::from_secs(args.lookback_hours.saturating_mul(3600));
            }
            Command::Backfill(args) => {
                settings.max_cells = args.max_cells as usize;
            }
            Command::Prune | Command::Reindex => {}
        }
        settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }
}

fn parse_cli_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("`{raw}` is not an RFC 3339 timestamp or YYYY-MM-DD date"))
}

/// Like [`parse_cli_timestamp`], but a bare date covers the whole day.
fn parse_cli_end_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(day) => day
            .succ_opt()
            .and_then(|next| next.and_hms_opt(0, 0, 0))
            .map(|midnight| midnight.and_utc() - TimeDelta::nanoseconds(1))
            .ok_or_else(|| format!("`{raw}` is out of range")),
        Err(_) => parse_cli_timestamp(raw),
    }
}

fn parse_seconds(raw: &str) -> Result<StdDuration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("`{raw}` must be a non-negative number of seconds"));
    }
    Ok(StdDuration::from_millis((secs * 1000.0).round() as u64))
}
