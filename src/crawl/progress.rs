//! The backfill cursor.
//!
//! Progress walks the cartesian product `sources × months(window)` in
//! source-major order. Every cell before the cursor is fully processed, the
//! cell at the cursor may be partially processed, and every cell after it is
//! untouched. Re-processing a partial cell is safe because the dedup index
//! skips what was already committed.
//!
//! The cursor is only meaningful against the source list it was built for,
//! so the ordered source keys are persisted next to the window. A different
//! list (an edited registry, or `--only`) starts the window over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::store::{StoreError, read_json_or_none, write_json_atomic};

/// Where the cursor currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Active { source_idx: usize, month_idx: usize },
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Source keys in cursor order.
    #[serde(default)]
    pub sources: Vec<String>,
    pub source_idx: usize,
    pub month_idx: usize,
    pub done: bool,
}

impl Progress {
    /// `ACTIVE(0, 0)` for a new window over `sources`.
    pub fn fresh(window_start: DateTime<Utc>, window_end: DateTime<Utc>, sources: Vec<String>) -> Self {
        Self {
            window_start,
            window_end,
            sources,
            source_idx: 0,
            month_idx: 0,
            done: false,
        }
    }

    /// Pick the cursor for this invocation.
    ///
    /// Missing bounds are taken from the persisted window, else default to
    /// `floor` and `now`. The cursor resumes only when both the window and
    /// the ordered `sources` equal the persisted ones; anything else discards
    /// prior progress.
    ///
    /// # Arguments
    ///
    /// * `persisted` - Cursor read from disk, if any
    /// * `start`, `end` - Window bounds requested on the command line
    /// * `sources` - Source keys of the registry for this run, in order
    /// * `floor`, `now` - Fallbacks for missing bounds
    pub fn resolve(
        persisted: Option<Progress>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        sources: &[String],
        floor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let window_start = start
            .or_else(|| persisted.as_ref().map(|p| p.window_start))
            .unwrap_or(floor);
        let window_end = end
            .or_else(|| persisted.as_ref().map(|p| p.window_end))
            .unwrap_or(now);

        match persisted {
            Some(p) if p.window_start != window_start || p.window_end != window_end => {
                warn!(
                    old_start = %p.window_start,
                    old_end = %p.window_end,
                    new_start = %window_start,
                    new_end = %window_end,
                    "Backfill window changed; discarding previous progress"
                );
                Self::fresh(window_start, window_end, sources.to_vec())
            }
            Some(p) if p.sources != sources => {
                warn!(
                    old_sources = p.sources.len(),
                    new_sources = sources.len(),
                    "Source list changed; discarding previous progress"
                );
                Self::fresh(window_start, window_end, sources.to_vec())
            }
            Some(p) => {
                info!(state = ?p.state(), "Resuming backfill cursor");
                p
            }
            None => {
                info!(%window_start, %window_end, "Starting new backfill window");
                Self::fresh(window_start, window_end, sources.to_vec())
            }
        }
    }

    pub fn state(&self) -> CursorState {
        if self.done {
            CursorState::Complete
        } else {
            CursorState::Active {
                source_idx: self.source_idx,
                month_idx: self.month_idx,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Mark the cell at the cursor processed and move to the next one.
    pub fn advance(&mut self, month_count: usize, source_count: usize) {
        if self.done {
            return;
        }
        self.month_idx += 1;
        if self.month_idx >= month_count {
            self.source_idx += 1;
            self.month_idx = 0;
        }
        self.settle(source_count);
    }

    /// Treat every remaining month of the current source as processed.
    pub fn skip_source(&mut self, source_count: usize) {
        if self.done {
            return;
        }
        self.source_idx += 1;
        self.month_idx = 0;
        self.settle(source_count);
    }

    /// Complete once the source axis is exhausted.
    pub fn settle(&mut self, source_count: usize) {
        if self.source_idx >= source_count {
            self.done = true;
        }
    }

    pub async fn load(path: &Path) -> Option<Self> {
        read_json_or_none(path).await
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self).await
    }
}
