//! # News Harvest
//!
//! A resumable, time-budgeted crawler that harvests news articles from a
//! fixed list of publishers, stores each distinct article exactly once, and
//! keeps the results as monthly JSON shards for a static site.
//!
//! ## Features
//!
//! - Daily incremental runs from RSS/Atom feeds, with a sitemap fallback
//! - Historical backfill over sitemaps with a persisted `(source, month)` cursor
//! - URL canonicalization and a durable dedup index
//! - A soft time budget that checkpoints and exits before a CI runner's hard limit
//! - Optional publishing (e.g. `git commit && git push`) at every checkpoint
//!
//! ## Usage
//!
//! ```sh
//! news_harvest daily
//! news_harvest backfill --start 2025-01-01 --max-cells 6
//! news_harvest prune
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: feeds and sitemaps yield candidate URLs
//! 2. **Dedup**: candidates are canonicalized and checked against the index
//! 3. **Enrichment**: new articles are fetched and scraped for metadata and text
//! 4. **Storage**: items are appended to their publication month's shard
//! 5. **Checkpoint**: dedup index, cursor and shard summary are written, then published

use chrono::Utc;
use clap::Parser;
use std::error::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod canonical;
mod cli;
mod config;
mod crawl;
mod extract;
mod feeds;
mod fetch;
mod models;
mod prune;
mod sitemap;
mod store;
mod utils;
mod xml;

use cli::{Cli, Command};
use config::{HarvestSettings, SourceRegistry};
use crawl::{CommandPublisher, Harvester, RunReport, run_subscriber};
use extract::HtmlExtractor;
use fetch::{HttpFetcher, RetryFetch};
use store::{ShardStore, rebuild_index};
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_harvest starting up");

    // Parse CLI
    let args = Cli::parse();
    let settings = args.settings();
    debug!(?args.command, ?settings, "Parsed CLI arguments");

    // Early check: the data directory must be writable or nothing can be committed
    if let Err(e) = ensure_writable_dir(&settings.data_dir).await {
        error!(
            path = %settings.data_dir.display(),
            error = %e,
            "Data directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let store = ShardStore::new(&settings.data_dir);
    match &args.command {
        Command::Prune => {
            let report = prune::prune(&store).await?;
            info!(removed = report.removed(), kept = report.after, "Pruned data directory");
        }
        Command::Reindex => {
            let index = rebuild_index(&store).await?;
            info!(shards = index.months.len(), "Rebuilt shard index");
        }
        Command::Daily(_) | Command::Backfill(_) => {
            let report = harvest(&args, &settings).await?;
            info!(added = report.added, outcome = ?report.outcome, cells = report.cells, "Harvest complete");
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}

/// Run one crawl mode with checkpoint publishing on a subscriber task.
async fn harvest(args: &Cli, settings: &HarvestSettings) -> Result<RunReport, Box<dyn Error>> {
    let registry = SourceRegistry::load(&args.sources).await?.only(&args.only)?;
    if registry.is_empty() {
        warn!(path = %args.sources.display(), "Source registry is empty; nothing to harvest");
    }

    let fetcher = RetryFetch::new(HttpFetcher::new(args.http_timeout)?, args.retry_policy());
    let extractor = HtmlExtractor::new(&fetcher);

    let (events, receiver) = mpsc::unbounded_channel();
    let publisher = args.publish_command.clone().map(CommandPublisher::new);
    if publisher.is_none() {
        info!("No publish command configured; checkpoints are local only");
    }
    let subscriber = tokio::spawn(run_subscriber(receiver, publisher));

    let mut harvester = Harvester::open(settings, &registry, &fetcher, &extractor)
        .await
        .with_events(events);
    let now = Utc::now();
    let report = match &args.command {
        Command::Backfill(window) => harvester.backfill(window.start, window.end, now).await,
        _ => harvester.daily(now).await,
    };
    // Dropping the harvester closes the channel so the subscriber can drain and exit.
    drop(harvester);

    let published = subscriber.await?;
    debug!(checkpoints = published, "Checkpoint subscriber finished");
    Ok(report?)
}
