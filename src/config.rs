use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_VEHICLE_POSITIONS_URL: &str =
    "https://gtfs.edmonton.ca/TMGTFSRealTimeWebService/Vehicle/VehiclePositions.pb";
const DEFAULT_TRIP_UPDATES_URL: &str =
    "https://gtfs.edmonton.ca/TMGTFSRealTimeWebService/TripUpdate/TripUpdates.pb";
const DEFAULT_SCHEDULE_URL: &str = "https://gtfs.edmonton.ca/TMGTFSRealTimeWebService/GTFS/gtfs.zip";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub feeds: FeedConfig,
    pub schedule: ScheduleConfig,
    pub dedup: DedupConfig,
    pub validation: ValidationConfig,
    pub features: FeatureConfig,
    pub fetch: FetchConfig,
    pub cycle: CycleConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub vehicle_positions_url: String,
    pub trip_updates_url: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            vehicle_positions_url: DEFAULT_VEHICLE_POSITIONS_URL.to_string(),
            trip_updates_url: DEFAULT_TRIP_UPDATES_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub url: String,
    /// Used when the archive has no agency.txt timezone.
    pub timezone: String,
    /// Minimum age of the cached version before upstream is contacted again.
    pub refresh_interval_secs: u64,
    pub cache_dir: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SCHEDULE_URL.to_string(),
            timezone: "America/Edmonton".to_string(),
            refresh_interval_secs: 24 * 60 * 60,
            cache_dir: None,
        }
    }
}

impl ScheduleConfig {
    /// Cache directory, defaulting to the platform cache dir like the old GTFS cache did.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push("transit_pipeline");
            path
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Number of cycles a dedupe key is remembered for.
    pub retention_cycles: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { retention_cycles: 4 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_staleness_secs: i64,
    pub clock_skew_tolerance_secs: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_staleness_secs: 30 * 60,
            clock_skew_tolerance_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Inclusive local-hour bands, e.g. `[[7, 9], [16, 18]]`.
    pub rush_hour_bands: Vec<[u32; 2]>,
    pub route_encoding_path: Option<PathBuf>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rush_hour_bands: vec![[7, 9], [16, 18]],
            route_encoding_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_payload_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_payload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub interval_secs: u64,
    pub max_duration_secs: u64,
    pub run_on_interval: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_duration_secs: 25,
            run_on_interval: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub object_store_dir: PathBuf,
    pub record_store_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            object_store_dir: PathBuf::from("data/objects"),
            record_store_path: PathBuf::from("data/records.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_yaml(&content)
    }

    /// Loads `path` if it exists, otherwise falls back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Startup checks. Anything rejected here must never surface mid-cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("feeds.vehicle_positions_url", &self.feeds.vehicle_positions_url),
            ("feeds.trip_updates_url", &self.feeds.trip_updates_url),
            ("schedule.url", &self.schedule.url),
        ] {
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} is not configured", name)));
            }
            reqwest::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("{} is not a valid URL: {}", name, e)))?;
        }

        self.timezone()?;

        for band in &self.features.rush_hour_bands {
            let [start, end] = *band;
            if start > end || end > 23 {
                return Err(ConfigError::Invalid(format!(
                    "rush hour band {}-{} must satisfy start <= end <= 23",
                    start, end
                )));
            }
        }

        if self.dedup.retention_cycles == 0 {
            return Err(ConfigError::Invalid(
                "dedup.retention_cycles must be at least 1".to_string(),
            ));
        }

        if self.cycle.interval_secs == 0 || self.cycle.max_duration_secs >= self.cycle.interval_secs {
            return Err(ConfigError::Invalid(format!(
                "cycle.max_duration_secs ({}) must be below cycle.interval_secs ({})",
                self.cycle.max_duration_secs, self.cycle.interval_secs
            )));
        }

        Ok(())
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.schedule
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {}", self.schedule.timezone)))
    }

    pub fn route_encoding_path(&self) -> PathBuf {
        self.features
            .route_encoding_path
            .clone()
            .unwrap_or_else(|| self.schedule.resolved_cache_dir().join("route_encoding.json"))
    }
}
