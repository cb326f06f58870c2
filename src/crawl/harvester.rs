//! Run orchestration for both harvest modes.
//!
//! # Modes
//!
//! - **Backfill** walks every `(source, month)` cell of a window in cursor
//!   order, pulling candidates from each source's sitemap. Progress is
//!   persisted so the next invocation resumes at the cell it stopped in.
//! - **Daily** reads each source's feeds once and falls back to the sitemap
//!   over a short lookback when the feeds produced nothing new. It keeps no
//!   cursor.
//!
//! Both share one commit path: canonicalize, check the dedup index, enrich
//! through the content extractor, append to the item's shard, mark the key.
//!
//! # Consistency
//!
//! Shards are written on every commit; the dedup index, the cursor and the
//! shard summary are written at checkpoints. The files are replaced
//! atomically but not together. If the process dies between a shard write
//! and the next dedup save, the next run sees the key as new, the shard
//! refuses the duplicate id, and the key is re-marked: at most the
//! enrichment of those items is repeated, and nothing is stored twice.

use chrono::{DateTime, TimeDelta, Utc};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointReason};
use super::governor::Governor;
use super::progress::{CursorState, Progress};
use crate::canonical::identify;
use crate::config::{HarvestSettings, SourceConfig, SourceRegistry};
use crate::extract::ContentExtractor;
use crate::feeds::{FeedError, FeedReader};
use crate::fetch::Fetch;
use crate::models::{Candidate, Item};
use crate::sitemap::{CollectOptions, SitemapCollector};
use crate::store::{DEDUP_FILE, DedupIndex, PROGRESS_FILE, ShardStore, StoreError, rebuild_index};
use crate::utils::{month_window, months_between};

/// How an invocation ended. Every variant is a success: partial progress is resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    TimeBudget,
    CellLimit,
}

impl RunOutcome {
    fn checkpoint_reason(self) -> CheckpointReason {
        match self {
            RunOutcome::Complete => CheckpointReason::RunComplete,
            RunOutcome::TimeBudget => CheckpointReason::TimeBudget,
            RunOutcome::CellLimit => CheckpointReason::CellLimit,
        }
    }
}

/// Summary of one invocation, logged by the binary on exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Items added by this invocation.
    pub added: usize,
    pub outcome: RunOutcome,
    /// Cells (backfill) or sources (daily) fully processed.
    pub cells: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Added,
    /// Already known; nothing was fetched.
    Duplicate,
    /// Enriched or inspected but not stored.
    Dropped,
}

/// Drives the crawl for one invocation.
pub struct Harvester<'a, F, E> {
    settings: &'a HarvestSettings,
    registry: &'a SourceRegistry,
    fetcher: F,
    extractor: E,
    store: ShardStore,
    dedup: DedupIndex,
    events: Option<UnboundedSender<Checkpoint>>,
    added: usize,
    since_checkpoint: usize,
    /// Checkpoints taken by this invocation.
    checkpoints: usize,
    /// Cursor as of the last checkpoint.
    checkpointed_progress: Option<Progress>,
}

impl<'a, F: Fetch, E: ContentExtractor> Harvester<'a, F, E> {
    /// Open the data directory and load the dedup index.
    pub async fn open(
        settings: &'a HarvestSettings,
        registry: &'a SourceRegistry,
        fetcher: F,
        extractor: E,
    ) -> Self {
        let dedup = DedupIndex::load(&settings.data_dir.join(DEDUP_FILE)).await;
        if dedup.is_empty() {
            info!("Dedup index is empty; every candidate counts as new");
        }
        Self {
            settings,
            registry,
            fetcher,
            extractor,
            store: ShardStore::new(&settings.data_dir),
            dedup,
            events: None,
            added: 0,
            since_checkpoint: 0,
            checkpoints: 0,
            checkpointed_progress: None,
        }
    }

    /// Emit a [`Checkpoint`] on `events` after every checkpoint write.
    pub fn with_events(mut self, events: UnboundedSender<Checkpoint>) -> Self {
        self.events = Some(events);
        self
    }

    fn progress_path(&self) -> PathBuf {
        self.settings.data_dir.join(PROGRESS_FILE)
    }

    /// Historical backfill over `[start, end]`, resuming a persisted cursor.
    ///
    /// Missing bounds come from the persisted window, else the floor and
    /// `now`. Only a failure to write state is an error.
    #[instrument(level = "info", skip(self, now))]
    pub async fn backfill(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RunReport, StoreError> {
        let governor = Governor::start(self.settings.budget, self.settings.headroom);
        let registry = self.registry;
        let source_count = registry.len();
        let progress_path = self.progress_path();

        let mut progress = Progress::resolve(
            Progress::load(&progress_path).await,
            start,
            end,
            &registry.keys(),
            self.settings.floor,
            now,
        );
        progress.settle(source_count);
        progress.save(&progress_path).await?;
        if progress.is_complete() {
            info!(
                start = %progress.window_start,
                end = %progress.window_end,
                "Backfill window already complete; nothing to do"
            );
            return Ok(RunReport {
                added: 0,
                outcome: RunOutcome::Complete,
                cells: 0,
            });
        }

        let months = months_between(progress.window_start, progress.window_end);
        info!(
            sources = source_count,
            months = months.len(),
            limit = ?governor.limit(),
            max_cells = self.settings.max_cells,
            "Backfill starting"
        );

        let mut cells = 0usize;
        let outcome = loop {
            let CursorState::Active { source_idx, month_idx } = progress.state() else {
                break RunOutcome::Complete;
            };
            if governor.expired() {
                break RunOutcome::TimeBudget;
            }
            if cells >= self.settings.max_cells {
                break RunOutcome::CellLimit;
            }

            let Some(source) = registry.get(source_idx) else {
                progress.settle(source_count);
                continue;
            };
            let Some(sitemap) = source.sitemap.as_deref() else {
                info!(source = %source.key, "No sitemap configured; skipping source");
                progress.skip_source(source_count);
                progress.save(&progress_path).await?;
                continue;
            };
            let Some(&(year, month)) = months.get(month_idx) else {
                progress.skip_source(source_count);
                continue;
            };
            let Some((lo, hi)) = month_window(year, month, progress.window_start, progress.window_end)
            else {
                progress.advance(months.len(), source_count);
                continue;
            };

            info!(
                source = %source.key,
                cell = %format!("{year:04}-{month:02}"),
                source_idx,
                month_idx,
                remaining = ?governor.remaining(),
                "Processing cell"
            );
            let candidates = self.collect_sitemap(sitemap, lo, hi, &governor).await;
            if governor.expired() {
                info!(source = %source.key, "Time budget reached while reading sitemaps");
                break RunOutcome::TimeBudget;
            }
            let before = self.added;
            if self.drain(source, candidates, &governor, Some(&progress)).await? {
                break RunOutcome::TimeBudget;
            }
            info!(source = %source.key, added = self.added - before, "Cell finished");

            progress.advance(months.len(), source_count);
            cells += 1;
            self.checkpoint(CheckpointReason::CellBoundary, Some(&progress)).await?;
        };

        self.finish(outcome, Some(&progress)).await?;
        info!(added = self.added, cells, ?outcome, state = ?progress.state(), "Backfill finished");
        Ok(RunReport {
            added: self.added,
            outcome,
            cells,
        })
    }

    /// Daily incremental pass: feeds first, sitemap over the lookback as a fallback.
    #[instrument(level = "info", skip(self, now))]
    pub async fn daily(&mut self, now: DateTime<Utc>) -> Result<RunReport, StoreError> {
        let governor = Governor::start(self.settings.budget, self.settings.headroom);
        let registry = self.registry;
        let lookback = TimeDelta::from_std(self.settings.lookback).unwrap_or(TimeDelta::hours(72));
        let since = now - lookback;
        let mut cells = 0usize;

        let outcome = 'sources: {
            for source in &registry.sources {
                if governor.expired() {
                    break 'sources RunOutcome::TimeBudget;
                }
                let before = self.added;

                for feed_url in &source.feeds {
                    if governor.expired() {
                        break 'sources RunOutcome::TimeBudget;
                    }
                    let candidates = match self.read_feed(feed_url).await {
                        Ok(candidates) => candidates,
                        Err(e) => {
                            warn!(source = %source.key, feed = %feed_url, error = %e, "Feed unavailable; skipping");
                            Vec::new()
                        }
                    };
                    if self.drain(source, candidates, &governor, None).await? {
                        break 'sources RunOutcome::TimeBudget;
                    }
                    sleep(self.settings.feed_delay).await;
                }

                if self.added == before {
                    if let Some(sitemap) = source.sitemap.as_deref() {
                        info!(source = %source.key, %since, %now, "Feeds added nothing; falling back to sitemap");
                        let candidates = self.collect_sitemap(sitemap, since, now, &governor).await;
                        if self.drain(source, candidates, &governor, None).await? {
                            break 'sources RunOutcome::TimeBudget;
                        }
                    }
                }

                info!(source = %source.key, added = self.added - before, "Source finished");
                cells += 1;
                self.checkpoint(CheckpointReason::CellBoundary, None).await?;
            }
            RunOutcome::Complete
        };

        self.finish(outcome, None).await?;
        info!(added = self.added, sources = cells, ?outcome, "Daily run finished");
        Ok(RunReport {
            added: self.added,
            outcome,
            cells,
        })
    }

    async fn collect_sitemap(
        &self,
        url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        governor: &Governor,
    ) -> Vec<Candidate> {
        let options = CollectOptions {
            polite_delay: self.settings.sitemap_delay,
            infer_dates: self.settings.infer_dates,
            deadline: Some(governor.deadline()),
        };
        SitemapCollector::new(&self.fetcher, options)
            .collect(url, start, end)
            .await
    }

    async fn read_feed(&self, url: &str) -> Result<Vec<Candidate>, FeedError> {
        FeedReader::new(&self.fetcher).read(url).await
    }

    /// Process candidates in order, checking the governor before each one.
    ///
    /// Returns `true` when the deadline stopped the batch early.
    async fn drain(
        &mut self,
        source: &SourceConfig,
        candidates: Vec<Candidate>,
        governor: &Governor,
        progress: Option<&Progress>,
    ) -> Result<bool, StoreError> {
        for candidate in candidates {
            if governor.expired() {
                info!(source = %source.key, elapsed = ?governor.elapsed(), "Time budget reached");
                return Ok(true);
            }
            let disposition = self.commit(source, candidate).await?;
            if disposition == Disposition::Added {
                if let Some(progress) = progress {
                    progress.save(&self.progress_path()).await?;
                }
                if self.since_checkpoint >= self.settings.checkpoint_every {
                    self.checkpoint(CheckpointReason::ItemThreshold, progress).await?;
                }
            }
            if disposition != Disposition::Duplicate {
                sleep(self.settings.item_delay).await;
            }
        }
        Ok(false)
    }

    /// The single commit path shared by both modes.
    async fn commit(&mut self, source: &SourceConfig, candidate: Candidate) -> Result<Disposition, StoreError> {
        let (url, key) = identify(&candidate.url);
        if self.dedup.contains(&key) {
            debug!(%url, "Already harvested");
            return Ok(Disposition::Duplicate);
        }
        if candidate.published_at.is_some_and(|at| at < self.settings.floor) {
            debug!(%url, "Published before the floor; skipping");
            return Ok(Disposition::Dropped);
        }

        let extracted = match self.extractor.extract(&url).await {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(%url, error = %e, "Content extraction failed; keeping known metadata");
                None
            }
        };
        let published_at = extracted
            .as_ref()
            .and_then(|data| data.published_at)
            .or(candidate.published_at);
        let Some(published_at) = published_at else {
            info!(%url, "No publication time known; dropping entry");
            return Ok(Disposition::Dropped);
        };
        if published_at < self.settings.floor {
            debug!(%url, %published_at, "Published before the floor; skipping");
            return Ok(Disposition::Dropped);
        }

        let mut item = Item::new(&url, &source.display_name, published_at);
        item.title = candidate.title.unwrap_or_default().trim().to_string();
        item.summary = candidate.summary.unwrap_or_default().trim().to_string();
        item.author = candidate.author.unwrap_or_default().trim().to_string();
        if let Some(data) = extracted {
            item.apply(data);
        }
        if item.title.is_empty() {
            item.title = source.display_name.clone();
        }

        if !self.store.append(&item).await? {
            warn!(%url, "Item already present in its shard; re-marking key");
            self.dedup.mark(&key);
            return Ok(Disposition::Duplicate);
        }
        self.dedup.mark(&key);
        self.added += 1;
        self.since_checkpoint += 1;
        info!(
            source = %source.key,
            %url,
            published_at = %item.published_at,
            fulltext = item.can_publish_fulltext,
            added = self.added,
            "Added item"
        );
        Ok(Disposition::Added)
    }

    /// Take the closing checkpoint unless nothing changed since the last one.
    async fn finish(&mut self, outcome: RunOutcome, progress: Option<&Progress>) -> Result<(), StoreError> {
        let unchanged = self.checkpoints > 0
            && self.since_checkpoint == 0
            && self.checkpointed_progress.as_ref() == progress;
        if unchanged {
            debug!(?outcome, "Nothing new since the last checkpoint; not checkpointing again");
            return Ok(());
        }
        self.checkpoint(outcome.checkpoint_reason(), progress).await
    }

    /// Persist dedup index, cursor and shard summary, then notify subscribers.
    async fn checkpoint(&mut self, reason: CheckpointReason, progress: Option<&Progress>) -> Result<(), StoreError> {
        self.dedup.save().await?;
        if let Some(progress) = progress {
            progress.save(&self.progress_path()).await?;
        }
        let index = rebuild_index(&self.store).await?;
        self.since_checkpoint = 0;
        self.checkpoints += 1;
        self.checkpointed_progress = progress.cloned();
        info!(
            %reason,
            added = self.added,
            keys = self.dedup.len(),
            shards = index.months.len(),
            "Checkpoint written"
        );
        if let Some(events) = &self.events {
            if events.send(Checkpoint::new(reason, self.added)).is_err() {
                warn!("Checkpoint subscriber is gone; event dropped");
            }
        }
        Ok(())
    }
}
