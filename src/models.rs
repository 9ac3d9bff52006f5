// Record types flowing through the ingestion-reconciliation pipeline.
//
// Feed records are produced by the decoder, filtered by the validator, joined
// against the static schedule by the reconciler and finally turned into
// feature vectors. Everything here is plain data: no I/O, no shared state.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Feed Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    VehiclePositions,
    TripUpdates,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "vehicles",
            FeedKind::TripUpdates => "trip_updates",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Vehicle Positions
// ============================================================================

/// Passenger load reported by the vehicle, mirroring GTFS-RT `OccupancyStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyStatus {
    Empty,
    ManySeatsAvailable,
    FewSeatsAvailable,
    StandingRoomOnly,
    CrushedStandingRoomOnly,
    Full,
    NotAcceptingPassengers,
    NoDataAvailable,
    NotBoardable,
}

impl OccupancyStatus {
    /// Maps the raw protobuf enum value. Unknown values yield `None`.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(OccupancyStatus::Empty),
            1 => Some(OccupancyStatus::ManySeatsAvailable),
            2 => Some(OccupancyStatus::FewSeatsAvailable),
            3 => Some(OccupancyStatus::StandingRoomOnly),
            4 => Some(OccupancyStatus::CrushedStandingRoomOnly),
            5 => Some(OccupancyStatus::Full),
            6 => Some(OccupancyStatus::NotAcceptingPassengers),
            7 => Some(OccupancyStatus::NoDataAvailable),
            8 => Some(OccupancyStatus::NotBoardable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePositionRecord {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    /// Epoch seconds as reported by the feed.
    pub timestamp: i64,
    pub occupancy_status: Option<OccupancyStatus>,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub current_status: Option<i32>,
    pub congestion_level: Option<i32>,
}

// ============================================================================
// Trip Updates
// ============================================================================

/// GTFS-RT `StopTimeUpdate.ScheduleRelationship`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleRelationship {
    #[default]
    Scheduled,
    Skipped,
    NoData,
}

impl ScheduleRelationship {
    /// UNSCHEDULED (3) and unknown values are treated as SCHEDULED.
    pub fn from_wire(value: Option<i32>) -> Self {
        match value {
            Some(1) => ScheduleRelationship::Skipped,
            Some(2) => ScheduleRelationship::NoData,
            _ => ScheduleRelationship::Scheduled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTimeUpdateRecord {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub predicted_arrival: Option<i64>,
    pub predicted_departure: Option<i64>,
    pub arrival_delay: Option<i32>,
    pub departure_delay: Option<i32>,
    pub schedule_relationship: ScheduleRelationship,
}

impl StopTimeUpdateRecord {
    /// Key used to keep one update per stop within a trip.
    pub fn stop_key(&self) -> String {
        match (&self.stop_id, self.stop_sequence) {
            (Some(stop_id), _) => stop_id.clone(),
            (None, Some(seq)) => format!("#{}", seq),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripUpdateRecord {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub vehicle_id: Option<String>,
    /// Service day from the trip descriptor, when the feed provides one.
    pub start_date: Option<NaiveDate>,
    pub stop_time_updates: Vec<StopTimeUpdateRecord>,
    /// Inherited from the feed header.
    pub timestamp: i64,
}

// ============================================================================
// Reconciliation Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Schedule entry found and a delay was computed.
    Matched,
    /// Schedule entry found but the update carried no usable prediction.
    MissingPrediction,
    /// No schedule entry exists for this trip/stop.
    NoSchedule,
    /// No schedule version was available for the cycle.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub trip_id: String,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub route_id: Option<String>,
    pub observed_epoch: Option<i64>,
    pub scheduled_epoch: Option<i64>,
    /// `observed_epoch - scheduled_epoch`; positive means late.
    pub delay_seconds: Option<i64>,
    pub is_matched: bool,
    pub match_status: MatchStatus,
    pub schedule_relationship: ScheduleRelationship,
    /// Capture timestamp of the trip update this record came from.
    pub capture_epoch: i64,
}

// ============================================================================
// Features
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub hour_of_day: u32,
    /// 0 = Monday ... 6 = Sunday
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub is_rush_hour: bool,
    /// 0 = night, 1 = morning, 2 = afternoon, 3 = evening
    pub time_of_day: u8,
    /// -1 when the record has no route.
    pub route_id_encoded: i64,
    /// -1 when the update carried no stop sequence.
    pub stop_sequence: i64,
    /// `WEATHER_TEMP_SENTINEL` when no temperature was supplied.
    pub weather_temp_c: f64,
    pub has_weather: bool,
    pub delay_seconds: Option<i64>,
}
