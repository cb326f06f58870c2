//! The resumable, time-budgeted crawl engine.
//!
//! - [`progress`]: the persisted `(source, month)` cursor
//! - [`governor`]: the soft deadline
//! - [`checkpoint`]: checkpoint events and their publisher
//! - [`harvester`]: drives both run modes on top of the above

pub mod checkpoint;
pub mod governor;
pub mod harvester;
pub mod progress;

pub use checkpoint::{CommandPublisher, run_subscriber};
pub use harvester::{Harvester, RunReport};
