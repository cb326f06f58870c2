//! Checkpoint events and the publisher that externalizes them.
//!
//! The harvester writes its artifacts at safe boundaries and then emits a
//! [`Checkpoint`] on an unbounded channel. Publishing (typically a git
//! commit and push of the data directory) is a separate subscriber task, so
//! a slow or failing publisher never stalls or aborts the crawl.

use chrono::{DateTime, Utc};
use std::fmt;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, instrument, warn};

use crate::utils::truncate_for_log;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// N items committed since the previous checkpoint.
    ItemThreshold,
    /// A month-cell (or, in daily mode, a source) finished.
    CellBoundary,
    /// The governor's deadline was reached.
    TimeBudget,
    /// The per-invocation cell limit was reached.
    CellLimit,
    RunComplete,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::ItemThreshold => "item_threshold",
            CheckpointReason::CellBoundary => "cell_boundary",
            CheckpointReason::TimeBudget => "time_budget",
            CheckpointReason::CellLimit => "cell_limit",
            CheckpointReason::RunComplete => "run_complete",
        }
    }
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted after dedup index, progress and shard index have been written.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub reason: CheckpointReason,
    /// Items added so far in this invocation.
    pub added_total: usize,
    pub at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(reason: CheckpointReason, added_total: usize) -> Self {
        Self {
            reason,
            added_total,
            at: Utc::now(),
        }
    }

    /// Commit message suitable for a versioned publisher.
    pub fn message(&self) -> String {
        format!(
            "harvest: {} checkpoint (+{} items) at {}",
            self.reason,
            self.added_total,
            self.at.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Failure of one publish attempt. Never fatal to the crawl.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to spawn publish command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("publish command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Runs a shell command for every checkpoint.
///
/// The command sees `HARVEST_REASON`, `HARVEST_ADDED` and `HARVEST_MESSAGE`
/// in its environment.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    command: String,
}

impl CommandPublisher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    #[instrument(level = "info", skip_all, fields(reason = %checkpoint.reason))]
    pub async fn publish(&self, checkpoint: &Checkpoint) -> Result<(), PublishError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("HARVEST_REASON", checkpoint.reason.as_str())
            .env("HARVEST_ADDED", checkpoint.added_total.to_string())
            .env("HARVEST_MESSAGE", checkpoint.message())
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PublishError::Failed {
                status: output.status.to_string(),
                stderr: truncate_for_log(stderr.trim(), 500),
            });
        }
        info!(added = checkpoint.added_total, "Published checkpoint");
        Ok(())
    }
}

/// Drain checkpoint events until every sender is dropped.
///
/// Events that queued up while a publish was running are merged: every
/// artifact is already on disk by the time an event is sent, so publishing
/// the newest one covers the ones before it.
///
/// # Returns
///
/// How many events were received, merged ones included. Publisher failures
/// are logged and the loop keeps going.
pub async fn run_subscriber(
    mut events: UnboundedReceiver<Checkpoint>,
    publisher: Option<CommandPublisher>,
) -> usize {
    let mut seen = 0usize;
    while let Some(mut checkpoint) = events.recv().await {
        seen += 1;
        let mut merged = 0usize;
        while let Ok(newer) = events.try_recv() {
            seen += 1;
            merged += 1;
            checkpoint = newer;
        }
        if merged > 0 {
            debug!(merged, reason = %checkpoint.reason, "Merged queued checkpoints");
        }
        match &publisher {
            Some(publisher) => {
                if let Err(e) = publisher.publish(&checkpoint).await {
                    error!(reason = %checkpoint.reason, error = %e, "Checkpoint publish failed; continuing");
                }
            }
            None => warn!(
                reason = %checkpoint.reason,
                added = checkpoint.added_total,
                "No publish command configured; checkpoint stays local"
            ),
        }
    }
    seen
}
