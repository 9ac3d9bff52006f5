//! GTFS-Realtime ingestion and schedule reconciliation.
//!
//! Raw feed bytes are decoded, validated and deduplicated across cycles,
//! joined against the static GTFS schedule to compute per-stop delay, and
//! turned into feature vectors for storage and modeling.

pub mod config;
pub mod error;
pub mod features;
pub mod feed_decoder;
pub mod fetch;
pub mod gtfs_static;
pub mod models;
pub mod pipeline;
pub mod reconciler;
pub mod schedule;
pub mod sinks;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{CycleSummary, Pipeline};
pub use schedule::{ScheduleSource, ScheduleStore, ScheduleVersion};
