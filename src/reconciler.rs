// ============================================================================
// Delay Reconciliation
// ============================================================================

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{DelayRecord, MatchStatus, ScheduleRelationship, StopTimeUpdateRecord, TripUpdateRecord};
use crate::schedule::{ScheduleEntry, ScheduleVersion};

/// Delays within this many seconds either way count as on time.
pub const ON_TIME_THRESHOLD_SECS: i64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DelayStats {
    pub count: usize,
    pub mean_seconds: Option<f64>,
    pub median_seconds: Option<f64>,
    pub min_seconds: Option<i64>,
    pub max_seconds: Option<i64>,
    /// Share of delays within +/- `ON_TIME_THRESHOLD_SECS`.
    pub on_time_rate: Option<f64>,
    pub late_count: usize,
}

impl DelayStats {
    pub fn from_records(records: &[DelayRecord]) -> Self {
        let mut delays: Vec<i64> = records.iter().filter_map(|r| r.delay_seconds).collect();
        if delays.is_empty() {
            return Self::default();
        }
        delays.sort_unstable();

        let count = delays.len();
        let total: i128 = delays.iter().map(|d| i128::from(*d)).sum();
        let mean = total as f64 / count as f64;
        let median = if count % 2 == 0 {
            (i128::from(delays[count / 2 - 1]) + i128::from(delays[count / 2])) as f64 / 2.0
        } else {
            delays[count / 2] as f64
        };
        let on_time = delays.iter().filter(|d| d.unsigned_abs() <= ON_TIME_THRESHOLD_SECS.unsigned_abs()).count();

        Self {
            count,
            mean_seconds: Some(mean),
            median_seconds: Some(median),
            min_seconds: delays.first().copied(),
            max_seconds: delays.last().copied(),
            on_time_rate: Some(on_time as f64 / count as f64),
            late_count: delays.iter().filter(|d| **d > ON_TIME_THRESHOLD_SECS).count(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub records: Vec<DelayRecord>,
    pub matched: usize,
    pub missing_prediction: usize,
    pub unmatched: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DelayReconciler;

impl DelayReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Joins trip updates against `schedule`, one record per (trip, stop) in
    /// input order. Without a schedule every record comes out unmatched.
    pub fn reconcile(&self, updates: &[TripUpdateRecord], schedule: Option<&ScheduleVersion>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome {
            degraded: schedule.is_none(),
            ..ReconcileOutcome::default()
        };
        if outcome.degraded && !updates.is_empty() {
            warn!(trips = updates.len(), "No schedule version available, reconciling in degraded mode");
        }

        let mut seen: HashSet<(String, String)> = HashSet::new();

        for update in updates {
            for stu in &update.stop_time_updates {
                if !seen.insert((update.trip_id.clone(), stu.stop_key())) {
                    debug!(trip_id = %update.trip_id, stop = %stu.stop_key(), "Repeated stop in trip update, keeping first");
                    continue;
                }

                let record = match schedule {
                    Some(version) => reconcile_stop(update, stu, version),
                    None => unmatched(update, stu, MatchStatus::Degraded),
                };

                match record.match_status {
                    MatchStatus::Matched => outcome.matched += 1,
                    MatchStatus::MissingPrediction => outcome.missing_prediction += 1,
                    MatchStatus::NoSchedule | MatchStatus::Degraded => outcome.unmatched += 1,
                }
                outcome.records.push(record);
            }
        }

        outcome
    }
}

fn find_entry<'a>(
    version: &'a ScheduleVersion,
    trip_id: &str,
    stu: &StopTimeUpdateRecord,
) -> Option<&'a ScheduleEntry> {
    match (stu.stop_sequence, &stu.stop_id) {
        (Some(seq), _) => version.lookup(trip_id, seq),
        (None, Some(stop_id)) => version.lookup_by_stop(trip_id, stop_id),
        (None, None) => None,
    }
}

fn predicted_time(stu: &StopTimeUpdateRecord) -> Option<i64> {
    stu.predicted_arrival.or(stu.predicted_departure)
}

fn reconcile_stop(update: &TripUpdateRecord, stu: &StopTimeUpdateRecord, version: &ScheduleVersion) -> DelayRecord {
    let Some(entry) = find_entry(version, &update.trip_id, stu) else {
        return unmatched(update, stu, MatchStatus::NoSchedule);
    };

    let reference = predicted_time(stu).unwrap_or(update.timestamp);
    let service_day = version.resolve_service_day(entry, update.start_date, reference);
    let scheduled_arrival = service_day.and_then(|day| version.scheduled_epoch(entry, day, true));
    let scheduled_departure = service_day.and_then(|day| version.scheduled_epoch(entry, day, false));

    let mut record = DelayRecord {
        trip_id: update.trip_id.clone(),
        stop_id: stu.stop_id.clone().or_else(|| Some(entry.stop_id.clone())),
        stop_sequence: stu.stop_sequence.or(Some(entry.stop_sequence)),
        route_id: update.route_id.clone().or_else(|| entry.route_id.clone()),
        observed_epoch: None,
        scheduled_epoch: scheduled_arrival,
        delay_seconds: None,
        is_matched: true,
        match_status: MatchStatus::MissingPrediction,
        schedule_relationship: stu.schedule_relationship,
        capture_epoch: update.timestamp,
    };

    if stu.schedule_relationship != ScheduleRelationship::Scheduled {
        return record;
    }

    // arrival first, then departure, then feed-provided relative delays
    let observed = match (stu.predicted_arrival, stu.predicted_departure) {
        (Some(arrival), _) => scheduled_arrival.map(|s| (arrival, s)),
        (None, Some(departure)) => scheduled_departure.map(|s| (departure, s)),
        (None, None) => match (stu.arrival_delay, stu.departure_delay) {
            (Some(delay), _) => scheduled_arrival.and_then(|s| Some((s.checked_add(i64::from(delay))?, s))),
            (None, Some(delay)) => scheduled_departure.and_then(|s| Some((s.checked_add(i64::from(delay))?, s))),
            (None, None) => None,
        },
    };

    // predictions far enough out to overflow are treated as absent
    let delay = observed.and_then(|(observed, scheduled)| Some((observed, scheduled, observed.checked_sub(scheduled)?)));
    match delay {
        Some((observed, scheduled, delay)) => {
            record.observed_epoch = Some(observed);
            record.scheduled_epoch = Some(scheduled);
            record.delay_seconds = Some(delay);
            record.match_status = MatchStatus::Matched;
        }
        None if observed.is_some() => {
            warn!(trip_id = %update.trip_id, stop = %stu.stop_key(), "Predicted time out of range, ignoring prediction");
        }
        None => {}
    }

    record
}

fn unmatched(update: &TripUpdateRecord, stu: &StopTimeUpdateRecord, status: MatchStatus) -> DelayRecord {
    DelayRecord {
        trip_id: update.trip_id.clone(),
        stop_id: stu.stop_id.clone(),
        stop_sequence: stu.stop_sequence,
        route_id: update.route_id.clone(),
        observed_epoch: predicted_time(stu),
        scheduled_epoch: None,
        delay_seconds: None,
        is_matched: false,
        match_status: status,
        schedule_relationship: stu.schedule_relationship,
        capture_epoch: update.timestamp,
    }
}
