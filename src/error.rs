// ============================================================================
// Error Handling
// ============================================================================
//
// Whole-payload failures are errors; per-entity and per-record problems are
// counted warnings and never show up here.

use crate::models::FeedKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Whole-buffer decode failure. The feed kind yields no records this cycle.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Malformed {kind} feed: {reason}")]
    MalformedFeed { kind: FeedKind, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error fetching {url}: {reason}")]
    NetworkFailure { url: String, reason: String },
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("Payload from {url} too large: {size} bytes (max {max})")]
    PayloadTooLarge { url: String, size: usize, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule unavailable: {0}")]
    ScheduleUnavailable(String),
    #[error("Failed to open schedule archive: {0}")]
    Archive(String),
    #[error("Required table {0} missing from schedule archive")]
    MissingTable(&'static str),
    #[error("Failed to parse {table}: {reason}")]
    Parse { table: &'static str, reason: String },
    #[error("Unknown timezone: {0}")]
    Timezone(String),
    #[error("Cache file error: {0}")]
    Cache(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("Route encoding table {path}: {reason}")]
    EncodingTable { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to serialize {0}")]
    Serialize(String),
    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Cycle exceeded {0}s and was abandoned")]
    Timeout(u64),
    #[error("Another cycle is still running")]
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
