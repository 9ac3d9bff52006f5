// ============================================================================
// Ingestion Cycle
// ============================================================================
//
// One cycle: fetch and decode both feeds concurrently, validate and dedupe,
// reconcile trip updates against the schedule version active at cycle start,
// derive features, then hand the results to the sinks.
//
// The dedupe window and route encoder live behind a single async mutex taken
// with `try_lock`, so a second cycle arriving while one runs is refused
// instead of queued. Everything up to the sink writes runs under the cycle
// timeout; an abandoned cycle writes nothing and commits no dedupe keys.
// Sink writes are blocking file I/O and run on the blocking pool.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, CycleError, FeedError};
use crate::features::{FeatureDeriver, RouteEncoder, RushHourBands};
use crate::feed_decoder::{DecodedFeed, FeedDecoder};
use crate::fetch::FeedSource;
use crate::models::{DelayRecord, FeatureVector, FeedKind, TripUpdateRecord, VehiclePositionRecord};
use crate::reconciler::{DelayReconciler, DelayStats};
use crate::schedule::ScheduleStore;
use crate::sinks::{self, ObjectSink, RecordItem, RecordSink};
use crate::validator::{DedupeWindow, RecordValidator, ValidationOutcome};

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedStageSummary {
    pub fetched: bool,
    pub payload_bytes: usize,
    pub decoded: usize,
    pub entity_warnings: usize,
    pub accepted: usize,
    pub rejected_integrity: usize,
    pub rejected_duplicate: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub delay_records: usize,
    pub matched: usize,
    pub missing_prediction: usize,
    pub unmatched: usize,
    pub degraded: bool,
    pub schedule_version: Option<String>,
}

/// Per-stage counts for one cycle, so "no data" and "all rejected" can be
/// told apart.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: i64,
    pub duration_ms: u64,
    pub vehicle_positions: FeedStageSummary,
    pub trip_updates: FeedStageSummary,
    pub reconciliation: ReconcileSummary,
    pub delay_stats: DelayStats,
    pub features_derived: usize,
    pub objects_written: usize,
    pub records_written: usize,
    pub errors: Vec<String>,
}

// ============================================================================
// Pipeline
// ============================================================================

struct CycleState {
    window: DedupeWindow,
    features: FeatureDeriver,
}

/// Everything a cycle produced before it touches the sinks.
struct CycleOutput {
    positions: Vec<VehiclePositionRecord>,
    trips: Vec<TripUpdateRecord>,
    delays: Vec<(DelayRecord, FeatureVector)>,
    write_positions: bool,
    write_trips: bool,
}

pub struct Pipeline {
    decoder: FeedDecoder,
    validator: RecordValidator,
    reconciler: DelayReconciler,
    feeds: Arc<dyn FeedSource>,
    schedule: Arc<ScheduleStore>,
    object_sink: Arc<dyn ObjectSink>,
    record_sink: Arc<dyn RecordSink>,
    max_duration: Duration,
    state: Mutex<CycleState>,
    last_summary: RwLock<Option<CycleSummary>>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        feeds: Arc<dyn FeedSource>,
        schedule: Arc<ScheduleStore>,
        encoder: RouteEncoder,
        object_sink: Arc<dyn ObjectSink>,
        record_sink: Arc<dyn RecordSink>,
    ) -> Result<Self, ConfigError> {
        let features = FeatureDeriver::new(
            config.timezone()?,
            RushHourBands::new(&config.features.rush_hour_bands),
            encoder,
        );

        Ok(Self {
            decoder: FeedDecoder::new(config.fetch.max_payload_bytes),
            validator: RecordValidator::new(config.validation.clone()),
            reconciler: DelayReconciler::new(),
            feeds,
            schedule,
            object_sink,
            record_sink,
            max_duration: Duration::from_secs(config.cycle.max_duration_secs),
            state: Mutex::new(CycleState {
                window: DedupeWindow::new(config.dedup.retention_cycles),
                features,
            }),
            last_summary: RwLock::new(None),
        })
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn schedule(&self) -> &Arc<ScheduleStore> {
        &self.schedule
    }

    pub fn last_summary(&self) -> Option<CycleSummary> {
        self.last_summary.read().ok().and_then(|s| s.clone())
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        self.run_cycle_at(Utc::now().timestamp()).await
    }

    /// Runs one cycle with `now` as the validation reference time.
    pub async fn run_cycle_at(&self, now: i64) -> Result<CycleSummary, CycleError> {
        let mut state = self.state.try_lock().map_err(|_| {
            warn!("Cycle requested while another is running, skipping");
            CycleError::Busy
        })?;

        let started = Instant::now();
        let mut summary = CycleSummary {
            cycle: state.window.begin_cycle(),
            started_at: now,
            ..CycleSummary::default()
        };

        let output = match tokio::time::timeout(self.max_duration, self.execute(&mut state, now, &mut summary)).await {
            Ok(output) => output,
            Err(_) => {
                state.window.discard_staged();
                error!(
                    cycle = summary.cycle,
                    max_secs = self.max_duration.as_secs_f64(),
                    "Cycle exceeded its time budget, output discarded"
                );
                return Err(CycleError::Timeout(self.max_duration.as_secs()));
            }
        };

        self.write_outputs(output, now, &mut summary).await;
        state.window.commit_cycle();

        if let Err(e) = state.features.encoder_mut().save() {
            warn!("Failed to persist route encoding: {}", e);
            summary.errors.push(e.to_string());
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            cycle = summary.cycle,
            positions = summary.vehicle_positions.accepted,
            trips = summary.trip_updates.accepted,
            delays = summary.reconciliation.delay_records,
            matched = summary.reconciliation.matched,
            degraded = summary.reconciliation.degraded,
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms,
            "Cycle complete"
        );

        if let Ok(mut last) = self.last_summary.write() {
            *last = Some(summary.clone());
        }
        Ok(summary)
    }

    async fn execute(&self, state: &mut CycleState, now: i64, summary: &mut CycleSummary) -> CycleOutput {
        // readers keep this version for the whole cycle even if a refresh swaps it
        let schedule = self.schedule.active();

        let (positions, trips) = tokio::join!(
            self.ingest(FeedKind::VehiclePositions, |d, p| d.decode_vehicle_positions(p)),
            self.ingest(FeedKind::TripUpdates, |d, p| d.decode_trip_updates(p)),
        );
        let (positions, mut position_stage) = positions;
        let (trips, mut trip_stage) = trips;

        let write_positions = position_stage.error.is_none();
        let write_trips = trip_stage.error.is_none();
        summary.errors.extend(position_stage.error.clone());
        summary.errors.extend(trip_stage.error.clone());

        let positions = self.validator.validate(positions.records, &mut state.window, now);
        record_validation(&mut position_stage, &positions);
        let trips = self.validator.validate(trips.records, &mut state.window, now);
        record_validation(&mut trip_stage, &trips);

        let reconciled = self.reconciler.reconcile(&trips.accepted, schedule.as_deref());
        if reconciled.degraded && !trips.accepted.is_empty() {
            summary.errors.push("schedule unavailable, delays not computed".to_string());
        }

        summary.delay_stats = DelayStats::from_records(&reconciled.records);
        summary.reconciliation = ReconcileSummary {
            delay_records: reconciled.records.len(),
            matched: reconciled.matched,
            missing_prediction: reconciled.missing_prediction,
            unmatched: reconciled.unmatched,
            degraded: reconciled.degraded,
            schedule_version: schedule.as_ref().map(|v| v.info().content_hash.clone()),
        };

        // local time follows the zone the delays were reconciled in
        let timezone = schedule
            .as_ref()
            .map(|v| v.timezone())
            .unwrap_or_else(|| state.features.timezone());
        let delays: Vec<(DelayRecord, FeatureVector)> = reconciled
            .records
            .into_iter()
            .map(|record| {
                let observed = record.observed_epoch.unwrap_or(record.capture_epoch);
                let features = state.features.derive_in(timezone, &record, observed, None);
                (record, features)
            })
            .collect();
        summary.features_derived = delays.len();

        summary.vehicle_positions = position_stage;
        summary.trip_updates = trip_stage;

        CycleOutput {
            positions: positions.accepted,
            trips: trips.accepted,
            delays,
            write_positions,
            write_trips,
        }
    }

    /// Fetches and decodes one feed kind. Failures yield an empty batch.
    async fn ingest<T>(
        &self,
        kind: FeedKind,
        decode: impl Fn(&FeedDecoder, &[u8]) -> Result<DecodedFeed<T>, FeedError>,
    ) -> (DecodedFeed<T>, FeedStageSummary) {
        let mut stage = FeedStageSummary::default();

        let payload = match self.feeds.fetch(kind).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(feed = %kind, "Feed fetch failed, continuing without it: {}", e);
                stage.error = Some(e.to_string());
                return (DecodedFeed::empty(kind), stage);
            }
        };
        stage.fetched = true;
        stage.payload_bytes = payload.len();

        match decode(&self.decoder, &payload) {
            Ok(decoded) => {
                stage.decoded = decoded.records.len();
                stage.entity_warnings = decoded.warnings.len();
                (decoded, stage)
            }
            Err(e) => {
                error!(feed = %kind, "{}", e);
                stage.error = Some(e.to_string());
                (DecodedFeed::empty(kind), stage)
            }
        }
    }

    async fn write_outputs(&self, output: CycleOutput, now: i64, summary: &mut CycleSummary) {
        let object_sink = self.object_sink.clone();
        let record_sink = self.record_sink.clone();
        let written =
            tokio::task::spawn_blocking(move || write_batches(object_sink.as_ref(), record_sink.as_ref(), &output, now))
                .await;

        match written {
            Ok(written) => {
                summary.objects_written += written.objects;
                summary.records_written += written.records;
                summary.errors.extend(written.errors);
            }
            Err(e) => {
                error!("Sink writer task failed: {}", e);
                summary.errors.push(format!("sink writer task failed: {}", e));
            }
        }
    }
}

#[derive(Default)]
struct Written {
    objects: usize,
    records: usize,
    errors: Vec<String>,
}

fn write_batches(object_sink: &dyn ObjectSink, record_sink: &dyn RecordSink, output: &CycleOutput, now: i64) -> Written {
    let mut written = Written::default();
    let captured_at = DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_default();

    for (enabled, kind) in [
        (output.write_positions, FeedKind::VehiclePositions),
        (output.write_trips, FeedKind::TripUpdates),
    ] {
        if !enabled {
            continue;
        }
        let result = match kind {
            FeedKind::VehiclePositions => sinks::put_batch(object_sink, kind, captured_at, &output.positions),
            FeedKind::TripUpdates => sinks::put_batch(object_sink, kind, captured_at, &output.trips),
        };
        match result {
            Ok(_) => written.objects += 1,
            Err(e) => {
                error!(feed = %kind, "Object write failed: {}", e);
                written.errors.push(e.to_string());
            }
        }
    }

    for (delay, features) in &output.delays {
        let item = RecordItem::new(delay.clone(), features.clone());
        match record_sink.put_record(&item) {
            Ok(()) => written.records += 1,
            Err(e) => {
                error!(sk = %item.sk, "Record write failed: {}", e);
                written.errors.push(e.to_string());
            }
        }
    }

    written
}

fn record_validation<T>(stage: &mut FeedStageSummary, outcome: &ValidationOutcome<T>) {
    stage.accepted = outcome.accepted.len();
    stage.rejected_integrity = outcome.rejected_integrity;
    stage.rejected_duplicate = outcome.rejected_duplicate;
}
