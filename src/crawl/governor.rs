//! Soft wall-clock deadline for one invocation.

use std::time::Duration as StdDuration;
use tokio::time::Instant;

/// Lowest effective limit, so a near-zero budget still allows some work.
pub const MIN_LIMIT: StdDuration = StdDuration::from_secs(60);

/// Tells the engine when to checkpoint and return before an external hard kill.
///
/// Uses Tokio's clock so tests can drive it with paused time.
#[derive(Debug, Clone, Copy)]
pub struct Governor {
    started: Instant,
    limit: StdDuration,
}

impl Governor {
    /// Start the clock now; the limit is `max(60s, budget - headroom)`.
    pub fn start(budget: StdDuration, headroom: StdDuration) -> Self {
        Self {
            started: Instant::now(),
            limit: budget.saturating_sub(headroom).max(MIN_LIMIT),
        }
    }

    pub fn limit(&self) -> StdDuration {
        self.limit
    }

    pub fn elapsed(&self) -> StdDuration {
        self.started.elapsed()
    }

    /// The instant at which [`Governor::expired`] turns true.
    pub fn deadline(&self) -> Instant {
        self.started + self.limit
    }

    pub fn remaining(&self) -> StdDuration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.limit
    }
}
