// ============================================================================
// Feature Derivation
// ============================================================================
//
// Calendar features are taken in the transit system's local time. Route
// codes are assigned once and persisted so training and inference agree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FeatureError;
use crate::models::{DelayRecord, FeatureVector};

/// Stored in `weather_temp_c` when no temperature is known. Far outside any
/// real reading so models can tell it apart from 0 °C.
pub const WEATHER_TEMP_SENTINEL: f64 = -999.0;
pub const MISSING_ROUTE_CODE: i64 = -1;
pub const MISSING_STOP_SEQUENCE: i64 = -1;

/// Inclusive local-hour ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RushHourBands(Vec<(u32, u32)>);

impl RushHourBands {
    pub fn new(bands: &[[u32; 2]]) -> Self {
        Self(bands.iter().map(|[start, end]| (*start, *end)).collect())
    }

    pub fn contains(&self, hour: u32) -> bool {
        self.0.iter().any(|(start, end)| (*start..=*end).contains(&hour))
    }
}

impl Default for RushHourBands {
    fn default() -> Self {
        Self::new(&[[7, 9], [16, 18]])
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EncodingTable {
    routes: BTreeMap<String, i64>,
}

/// Stable route id -> integer mapping, first seen first numbered.
#[derive(Debug, Default)]
pub struct RouteEncoder {
    table: EncodingTable,
    path: Option<PathBuf>,
    dirty: bool,
}

impl RouteEncoder {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the table at `path`; a missing file starts an empty table there.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, FeatureError> {
        let path = path.into();
        let table = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| encoding_error(&path, e))?;
            serde_json::from_str(&contents).map_err(|e| encoding_error(&path, e))?
        } else {
            EncodingTable::default()
        };
        info!(path = %path.display(), routes = table.routes.len(), "Loaded route encoding table");

        Ok(Self {
            table,
            path: Some(path),
            dirty: false,
        })
    }

    pub fn encode(&mut self, route_id: Option<&str>) -> i64 {
        let Some(route_id) = route_id.filter(|r| !r.is_empty()) else {
            return MISSING_ROUTE_CODE;
        };
        if let Some(code) = self.table.routes.get(route_id) {
            return *code;
        }

        let code = self.table.routes.len() as i64;
        debug!(route_id, code, "Assigned new route code");
        self.table.routes.insert(route_id.to_string(), code);
        self.dirty = true;
        code
    }

    pub fn get(&self, route_id: &str) -> Option<i64> {
        self.table.routes.get(route_id).copied()
    }

    pub fn len(&self) -> usize {
        self.table.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.routes.is_empty()
    }

    /// Writes the table back if new routes were assigned since the last save.
    pub fn save(&mut self) -> Result<(), FeatureError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| encoding_error(path, e))?;
        }
        let json = serde_json::to_string_pretty(&self.table).map_err(|e| encoding_error(path, e))?;
        std::fs::write(path, json).map_err(|e| encoding_error(path, e))?;
        self.dirty = false;
        Ok(())
    }
}

fn encoding_error(path: &Path, e: impl std::fmt::Display) -> FeatureError {
    FeatureError::EncodingTable {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

pub struct FeatureDeriver {
    timezone: Tz,
    rush_hours: RushHourBands,
    encoder: RouteEncoder,
}

impl FeatureDeriver {
    pub fn new(timezone: Tz, rush_hours: RushHourBands, encoder: RouteEncoder) -> Self {
        Self {
            timezone,
            rush_hours,
            encoder,
        }
    }

    pub fn encoder(&self) -> &RouteEncoder {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut RouteEncoder {
        &mut self.encoder
    }

    /// Zone used when no schedule version supplies one.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Builds the feature vector for `record` observed at `observed_epoch`.
    ///
    /// Only the route encoder is stateful; the same inputs always produce
    /// the same vector once a route has a code.
    pub fn derive(&mut self, record: &DelayRecord, observed_epoch: i64, weather_temp_c: Option<f64>) -> FeatureVector {
        self.derive_in(self.timezone, record, observed_epoch, weather_temp_c)
    }

    /// Like `derive`, with calendar features taken in `timezone`. Callers pass
    /// the zone the delay was reconciled in.
    pub fn derive_in(
        &mut self,
        timezone: Tz,
        record: &DelayRecord,
        observed_epoch: i64,
        weather_temp_c: Option<f64>,
    ) -> FeatureVector {
        let local = DateTime::<Utc>::from_timestamp(observed_epoch, 0)
            .unwrap_or_default()
            .with_timezone(&timezone);
        let hour = local.hour();
        let day_of_week = local.weekday().num_days_from_monday();

        let weather = weather_temp_c.filter(|t| t.is_finite());

        FeatureVector {
            hour_of_day: hour,
            day_of_week,
            is_weekend: day_of_week >= 5,
            is_rush_hour: self.rush_hours.contains(hour),
            time_of_day: time_of_day(hour),
            route_id_encoded: self.encoder.encode(record.route_id.as_deref()),
            stop_sequence: record.stop_sequence.map(i64::from).unwrap_or(MISSING_STOP_SEQUENCE),
            weather_temp_c: weather.unwrap_or(WEATHER_TEMP_SENTINEL),
            has_weather: weather.is_some(),
            delay_seconds: record.delay_seconds,
        }
    }
}

/// 0 night (0-5), 1 morning (6-11), 2 afternoon (12-17), 3 evening (18-23).
pub fn time_of_day(hour: u32) -> u8 {
    match hour {
        0..=5 => 0,
        6..=11 => 1,
        12..=17 => 2,
        _ => 3,
    }
}
