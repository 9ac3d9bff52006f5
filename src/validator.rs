// Record integrity checks and cross-cycle deduplication.
//
// The dedupe window remembers fingerprints for a fixed number of cycles.
// Keys observed during the running cycle are staged and only become part of
// the window when the cycle commits, so an abandoned cycle leaves no trace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hasher;

use serde::Serialize;
use tracing::debug;

use crate::config::ValidationConfig;
use crate::models::{FeedKind, TripUpdateRecord, VehiclePositionRecord};

// ============================================================================
// Dedupe Keys
// ============================================================================

/// Content fingerprint of (record type, primary identifiers, capture timestamp).
///
/// Position fields are deliberately not part of the key: a re-published
/// observation with jittered coordinates is still the same observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DedupeKey(u64);

impl DedupeKey {
    fn fingerprint(kind: FeedKind, ids: &[&str], timestamp: i64) -> Self {
        let mut hasher = seahash::SeaHasher::new();
        hasher.write(kind.as_str().as_bytes());
        for id in ids {
            hasher.write_u8(0x1f);
            hasher.write(id.as_bytes());
        }
        hasher.write_u8(0x1e);
        hasher.write_i64(timestamp);
        DedupeKey(hasher.finish())
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

pub trait Deduplicable {
    fn dedupe_key(&self) -> DedupeKey;
}

impl Deduplicable for VehiclePositionRecord {
    fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::fingerprint(FeedKind::VehiclePositions, &[&self.vehicle_id], self.timestamp)
    }
}

impl Deduplicable for TripUpdateRecord {
    fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::fingerprint(FeedKind::TripUpdates, &[&self.trip_id], self.timestamp)
    }
}

// ============================================================================
// Dedupe Window
// ============================================================================

#[derive(Debug)]
pub struct DedupeWindow {
    retention_cycles: usize,
    current_cycle: u64,
    /// key -> last cycle in which it was committed
    seen: HashMap<DedupeKey, u64>,
    /// committed keys per cycle, oldest first
    generations: VecDeque<(u64, Vec<DedupeKey>)>,
    staged: HashSet<DedupeKey>,
}

impl DedupeWindow {
    pub fn new(retention_cycles: usize) -> Self {
        Self {
            retention_cycles: retention_cycles.max(1),
            current_cycle: 0,
            seen: HashMap::new(),
            generations: VecDeque::new(),
            staged: HashSet::new(),
        }
    }

    /// Starts a cycle. Keys left staged by an abandoned cycle are dropped.
    pub fn begin_cycle(&mut self) -> u64 {
        if !self.staged.is_empty() {
            debug!(discarded = self.staged.len(), "Discarding keys staged by an abandoned cycle");
            self.staged.clear();
        }
        self.current_cycle += 1;
        self.evict();
        self.current_cycle
    }

    /// Returns `true` when the key is new. Every observed key is staged, so a
    /// key that keeps showing up is carried into the current generation.
    pub fn observe(&mut self, key: DedupeKey) -> bool {
        let committed = self.seen.contains_key(&key);
        self.staged.insert(key) && !committed
    }

    pub fn contains(&self, key: &DedupeKey) -> bool {
        self.seen.contains_key(key) || self.staged.contains(key)
    }

    /// Publishes the staged keys into the window, refreshing keys already there.
    pub fn commit_cycle(&mut self) {
        let keys: Vec<DedupeKey> = self.staged.drain().collect();
        for key in &keys {
            self.seen.insert(*key, self.current_cycle);
        }
        self.generations.push_back((self.current_cycle, keys));
        self.evict();
    }

    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self) {
        // A key last committed in cycle c stays visible through cycle c + retention_cycles.
        let horizon = self.current_cycle.saturating_sub(self.retention_cycles as u64);
        while let Some((cycle, _)) = self.generations.front() {
            if *cycle >= horizon {
                break;
            }
            if let Some((cycle, keys)) = self.generations.pop_front() {
                for key in keys {
                    if self.seen.get(&key) == Some(&cycle) {
                        self.seen.remove(&key);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityRejection {
    StaleTimestamp,
    FutureTimestamp,
    LatitudeOutOfRange,
    LongitudeOutOfRange,
    NegativeSpeed,
    EmptyTripId,
    EmptyVehicleId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub processed: usize,
    pub valid: usize,
    pub invalid: usize,
    pub duplicate: usize,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome<T> {
    pub accepted: Vec<T>,
    pub rejected_integrity: usize,
    pub rejected_duplicate: usize,
    pub stats: ValidationStats,
}

pub trait Validatable: Deduplicable {
    fn check_integrity(&self, now: i64, config: &ValidationConfig) -> Result<(), IntegrityRejection>;
}

fn check_timestamp(timestamp: i64, now: i64, config: &ValidationConfig) -> Result<(), IntegrityRejection> {
    if timestamp < now - config.max_staleness_secs {
        return Err(IntegrityRejection::StaleTimestamp);
    }
    if timestamp > now + config.clock_skew_tolerance_secs {
        return Err(IntegrityRejection::FutureTimestamp);
    }
    Ok(())
}

impl Validatable for VehiclePositionRecord {
    fn check_integrity(&self, now: i64, config: &ValidationConfig) -> Result<(), IntegrityRejection> {
        check_timestamp(self.timestamp, now, config)?;

        if self.vehicle_id.is_empty() {
            return Err(IntegrityRejection::EmptyVehicleId);
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(IntegrityRejection::LatitudeOutOfRange);
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(IntegrityRejection::LongitudeOutOfRange);
        }
        if let Some(trip_id) = &self.trip_id {
            if trip_id.is_empty() {
                return Err(IntegrityRejection::EmptyTripId);
            }
        }
        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(IntegrityRejection::NegativeSpeed);
            }
        }
        Ok(())
    }
}

impl Validatable for TripUpdateRecord {
    fn check_integrity(&self, now: i64, config: &ValidationConfig) -> Result<(), IntegrityRejection> {
        check_timestamp(self.timestamp, now, config)?;
        if self.trip_id.is_empty() {
            return Err(IntegrityRejection::EmptyTripId);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordValidator {
    config: ValidationConfig,
}

impl RecordValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Splits a decoded batch into new records, integrity rejects and duplicates.
    ///
    /// Never fails: bad records are counted and dropped so the rest of the
    /// batch still flows through.
    pub fn validate<T: Validatable>(
        &self,
        records: Vec<T>,
        window: &mut DedupeWindow,
        now: i64,
    ) -> ValidationOutcome<T> {
        let mut stats = ValidationStats::default();
        let mut accepted = Vec::with_capacity(records.len());

        for record in records {
            stats.processed += 1;

            if let Err(reason) = record.check_integrity(now, &self.config) {
                debug!(?reason, "Rejected record");
                stats.invalid += 1;
                continue;
            }
            stats.valid += 1;

            if !window.observe(record.dedupe_key()) {
                stats.duplicate += 1;
                continue;
            }
            accepted.push(record);
        }

        ValidationOutcome {
            accepted,
            rejected_integrity: stats.invalid,
            rejected_duplicate: stats.duplicate,
            stats,
        }
    }
}
