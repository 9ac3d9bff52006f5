// ============================================================================
// Schedule Store
// ============================================================================
//
// A `ScheduleVersion` is built once from a parsed archive and never mutated.
// The store holds the active version behind an `Arc`; a refresh builds a new
// version and swaps the pointer, so readers that grabbed the old one keep a
// consistent view until they drop it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::ScheduleError;
use crate::fetch::{ConditionalHeaders, FetchOutcome, HttpFetcher};
use crate::gtfs_static::{self, CalendarDate, ExceptionType, ScheduleTables, ServiceCalendar};

/// Upper bound for a schedule archive download.
const MAX_ARCHIVE_BYTES: usize = 512 * 1024 * 1024;
const CACHE_FILE_NAME: &str = "schedule_cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub stop_id: String,
    pub stop_sequence: u32,
    /// Seconds past the service day's reference midnight.
    pub arrival_secs: u32,
    pub departure_secs: u32,
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrigin {
    Parsed,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleVersionInfo {
    /// seahash of the archive bytes, hex encoded.
    pub content_hash: String,
    pub source: String,
    pub fetched_at: i64,
    pub timezone: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub trips: usize,
    pub entries: usize,
    pub routes: usize,
}

/// On-disk form of a parsed version. Indexes are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct CachedSchedule {
    info: ScheduleVersionInfo,
    entries: Vec<ScheduleEntry>,
    calendar: Vec<ServiceCalendar>,
    calendar_dates: Vec<CalendarDate>,
}

#[derive(Debug)]
pub struct ScheduleVersion {
    info: ScheduleVersionInfo,
    origin: VersionOrigin,
    timezone: Tz,
    entries: Vec<ScheduleEntry>,
    by_trip_sequence: HashMap<(String, u32), usize>,
    by_trip_stop: HashMap<(String, String), usize>,
    by_route: HashMap<String, Vec<usize>>,
    calendar: HashMap<String, ServiceCalendar>,
    calendar_dates: HashMap<String, Vec<CalendarDate>>,
}

impl ScheduleVersion {
    pub fn from_tables(
        tables: ScheduleTables,
        fallback_timezone: Tz,
        mut info: ScheduleVersionInfo,
    ) -> Result<Self, ScheduleError> {
        let timezone = match tables.agency_timezone() {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ScheduleError::Timezone(name.to_string()))?,
            None => fallback_timezone,
        };

        let trips: HashMap<&str, &gtfs_static::Trip> =
            tables.trips.iter().map(|t| (t.trip_id.as_str(), t)).collect();

        let entries: Vec<ScheduleEntry> = tables
            .stop_times
            .iter()
            .map(|st| {
                let trip = trips.get(st.trip_id.as_str());
                ScheduleEntry {
                    trip_id: st.trip_id.clone(),
                    route_id: trip.map(|t| t.route_id.clone()),
                    stop_id: st.stop_id.clone(),
                    stop_sequence: st.stop_sequence,
                    arrival_secs: st.arrival_secs,
                    departure_secs: st.departure_secs,
                    service_id: trip.map(|t| t.service_id.clone()),
                }
            })
            .collect();

        info.timezone = timezone.name().to_string();
        info.trips = tables.trips.len();
        info.routes = tables.routes.len();

        Ok(Self::assemble(
            info,
            VersionOrigin::Parsed,
            timezone,
            entries,
            tables.calendar,
            tables.calendar_dates,
        ))
    }

    fn from_cached(cached: CachedSchedule) -> Result<Self, ScheduleError> {
        let timezone = cached
            .info
            .timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::Timezone(cached.info.timezone.clone()))?;
        Ok(Self::assemble(
            cached.info,
            VersionOrigin::Cache,
            timezone,
            cached.entries,
            cached.calendar,
            cached.calendar_dates,
        ))
    }

    fn assemble(
        mut info: ScheduleVersionInfo,
        origin: VersionOrigin,
        timezone: Tz,
        entries: Vec<ScheduleEntry>,
        calendar: Vec<ServiceCalendar>,
        calendar_dates: Vec<CalendarDate>,
    ) -> Self {
        let mut by_trip_sequence = HashMap::with_capacity(entries.len());
        let mut by_trip_stop = HashMap::with_capacity(entries.len());
        let mut by_route: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, entry) in entries.iter().enumerate() {
            by_trip_sequence
                .entry((entry.trip_id.clone(), entry.stop_sequence))
                .or_insert(index);
            // loop routes visit a stop twice; the first visit wins
            by_trip_stop
                .entry((entry.trip_id.clone(), entry.stop_id.clone()))
                .or_insert(index);
            if let Some(route_id) = &entry.route_id {
                by_route.entry(route_id.clone()).or_default().push(index);
            }
        }

        for indexes in by_route.values_mut() {
            indexes.sort_by(|a, b| {
                let (a, b) = (&entries[*a], &entries[*b]);
                (&a.trip_id, a.stop_sequence).cmp(&(&b.trip_id, b.stop_sequence))
            });
        }

        let mut dates: HashMap<String, Vec<CalendarDate>> = HashMap::new();
        for date in calendar_dates {
            dates.entry(date.service_id.clone()).or_default().push(date);
        }

        info.entries = entries.len();

        Self {
            info,
            origin,
            timezone,
            by_trip_sequence,
            by_trip_stop,
            by_route,
            calendar: calendar.into_iter().map(|c| (c.service_id.clone(), c)).collect(),
            calendar_dates: dates,
            entries,
        }
    }

    fn to_cached(&self) -> CachedSchedule {
        let mut calendar_dates: Vec<CalendarDate> =
            self.calendar_dates.values().flatten().cloned().collect();
        calendar_dates.sort_by(|a, b| (&a.service_id, a.date).cmp(&(&b.service_id, b.date)));

        CachedSchedule {
            info: self.info.clone(),
            entries: self.entries.clone(),
            calendar: self.calendar.values().cloned().collect(),
            calendar_dates,
        }
    }

    pub fn info(&self) -> &ScheduleVersionInfo {
        &self.info
    }

    pub fn origin(&self) -> VersionOrigin {
        self.origin
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, trip_id: &str, stop_sequence: u32) -> Option<&ScheduleEntry> {
        self.by_trip_sequence
            .get(&(trip_id.to_string(), stop_sequence))
            .map(|&i| &self.entries[i])
    }

    /// Fallback for stop-time updates that carry no stop sequence.
    pub fn lookup_by_stop(&self, trip_id: &str, stop_id: &str) -> Option<&ScheduleEntry> {
        self.by_trip_stop
            .get(&(trip_id.to_string(), stop_id.to_string()))
            .map(|&i| &self.entries[i])
    }

    /// Entries for a route ordered by trip then stop sequence.
    pub fn lookup_by_route(&self, route_id: &str) -> Vec<&ScheduleEntry> {
        self.by_route
            .get(route_id)
            .map(|indexes| indexes.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    /// Whether a service runs on `date`. Archives without any calendar data
    /// are treated as running every day.
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        if self.calendar.is_empty() && self.calendar_dates.is_empty() {
            return true;
        }

        if let Some(exceptions) = self.calendar_dates.get(service_id) {
            if let Some(exception) = exceptions.iter().find(|e| e.date == date) {
                return exception.exception_type == ExceptionType::Added;
            }
        }

        match self.calendar.get(service_id) {
            Some(cal) => {
                date >= cal.start_date
                    && date <= cal.end_date
                    && cal.weekdays[date.weekday().num_days_from_monday() as usize]
            }
            None => false,
        }
    }

    /// Absolute epoch of an entry's arrival (or departure) on `service_day`.
    pub fn scheduled_epoch(&self, entry: &ScheduleEntry, service_day: NaiveDate, arrival: bool) -> Option<i64> {
        let offset = if arrival { entry.arrival_secs } else { entry.departure_secs };
        service_time_to_epoch(self.timezone, service_day, offset)
    }

    /// Picks the service day an entry was observed on.
    ///
    /// With a `start_date` from the feed that date is authoritative. Otherwise
    /// the candidates around the observation's local date are filtered by
    /// calendar activity and the one scheduled closest to `observed_epoch` wins.
    pub fn resolve_service_day(
        &self,
        entry: &ScheduleEntry,
        start_date: Option<NaiveDate>,
        observed_epoch: i64,
    ) -> Option<NaiveDate> {
        if start_date.is_some() {
            return start_date;
        }

        let local_date = DateTime::<Utc>::from_timestamp(observed_epoch, 0)?
            .with_timezone(&self.timezone)
            .date_naive();

        let candidates: Vec<NaiveDate> = [local_date.pred_opt(), Some(local_date), local_date.succ_opt()]
            .into_iter()
            .flatten()
            .collect();
        let active = |day: &NaiveDate| match &entry.service_id {
            Some(service_id) => self.is_service_active(service_id, *day),
            None => true,
        };

        let closest = |days: &mut dyn Iterator<Item = NaiveDate>| {
            days.filter_map(|day| {
                let epoch = self.scheduled_epoch(entry, day, true)?;
                Some((day, epoch.abs_diff(observed_epoch)))
            })
            .min_by_key(|(_, distance)| *distance)
            .map(|(day, _)| day)
        };

        closest(&mut candidates.iter().copied().filter(active))
            .or_else(|| closest(&mut candidates.iter().copied()))
    }
}

/// Converts a GTFS time-of-day offset into epoch seconds.
///
/// GTFS measures offsets from "noon minus 12h" on the service day, not from
/// midnight, which differs from midnight on DST transition days. Offsets
/// beyond 24h land on the following calendar day.
pub fn service_time_to_epoch(timezone: Tz, service_day: NaiveDate, offset_secs: u32) -> Option<i64> {
    let noon = service_day.and_hms_opt(12, 0, 0)?;
    let noon = timezone.from_local_datetime(&noon).earliest()?;
    Some(noon.timestamp() - 12 * 3600 + i64::from(offset_secs))
}

// ============================================================================
// Store
// ============================================================================

/// Where a schedule archive comes from.
#[derive(Debug, Clone)]
pub enum ScheduleSource {
    Url(String),
    File(PathBuf),
    Bytes { label: String, data: Vec<u8> },
}

impl ScheduleSource {
    fn label(&self) -> String {
        match self {
            ScheduleSource::Url(url) => url.clone(),
            ScheduleSource::File(path) => path.display().to_string(),
            ScheduleSource::Bytes { label, .. } => label.clone(),
        }
    }
}

enum Obtained {
    Archive {
        data: Vec<u8>,
        validators: ConditionalHeaders,
    },
    NotModified,
}

pub struct ScheduleStore {
    config: ScheduleConfig,
    fallback_timezone: Tz,
    fetcher: Option<HttpFetcher>,
    active: RwLock<Option<Arc<ScheduleVersion>>>,
}

impl ScheduleStore {
    pub fn new(config: ScheduleConfig, fallback_timezone: Tz, fetcher: Option<HttpFetcher>) -> Self {
        Self {
            config,
            fallback_timezone,
            fetcher,
            active: RwLock::new(None),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.config.resolved_cache_dir().join(CACHE_FILE_NAME)
    }

    /// The version readers should use for the whole of their operation.
    pub fn active(&self) -> Option<Arc<ScheduleVersion>> {
        self.active.read().ok().and_then(|guard| guard.clone())
    }

    pub fn publish(&self, version: Arc<ScheduleVersion>) {
        match self.active.write() {
            Ok(mut guard) => {
                info!(
                    hash = %version.info.content_hash,
                    entries = version.len(),
                    origin = ?version.origin,
                    "Activated schedule version"
                );
                *guard = Some(version);
            }
            Err(e) => error!("Schedule lock poisoned, version not published: {}", e),
        }
    }

    pub fn lookup(&self, trip_id: &str, stop_sequence: u32) -> Option<ScheduleEntry> {
        self.active()?.lookup(trip_id, stop_sequence).cloned()
    }

    pub fn lookup_by_route(&self, route_id: &str) -> Vec<ScheduleEntry> {
        self.active()
            .map(|v| v.lookup_by_route(route_id).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Startup path: reuse a cached version younger than the refresh
    /// interval without touching the network, otherwise load from `source`.
    pub async fn initialize(&self, source: &ScheduleSource) -> Result<Arc<ScheduleVersion>, ScheduleError> {
        if let Some(cached) = self.read_cache() {
            let age = Utc::now().timestamp() - cached.info.fetched_at;
            if age >= 0 && (age as u64) < self.config.refresh_interval_secs {
                let version = Arc::new(cached);
                info!(age_secs = age, "Using cached schedule");
                self.publish(version.clone());
                return Ok(version);
            }
        }
        self.load(source).await
    }

    /// Fetches, parses, caches and activates a schedule version.
    ///
    /// An unchanged upstream (304 or identical content hash) reuses the cached
    /// parse. When nothing can be fetched the cached copy is used; with no
    /// cache either the result is `ScheduleUnavailable` and the active
    /// version, if any, is left in place.
    pub async fn load(&self, source: &ScheduleSource) -> Result<Arc<ScheduleVersion>, ScheduleError> {
        let cached = self.read_cache();
        let validators = cached.as_ref().map(|c| ConditionalHeaders {
            etag: c.info.etag.clone(),
            last_modified: c.info.last_modified.clone(),
        });

        let obtained = self.obtain(source, validators.as_ref()).await;

        let version = match (obtained, cached) {
            (Ok(Obtained::NotModified), Some(cached)) => {
                info!(source = %source.label(), "Schedule not modified upstream, reusing cache");
                cached
            }
            (Ok(Obtained::NotModified), None) => {
                // 304 without our own cache; shouldn't happen, nothing to reuse
                return self.unavailable(source, "upstream reported not modified but no cache exists");
            }
            (Ok(Obtained::Archive { data, validators }), cached) => {
                let hash = content_hash(&data);
                match cached {
                    Some(cached) if cached.info.content_hash == hash => {
                        info!(hash = %hash, "Schedule content unchanged, reusing cached parse");
                        cached
                    }
                    _ => match self.parse(source, &data, hash, validators) {
                        Ok(version) => {
                            self.write_cache(&version);
                            version
                        }
                        Err(e) => {
                            error!(source = %source.label(), "Failed to parse schedule: {}", e);
                            match self.read_cache() {
                                Some(cached) => cached,
                                None => return Err(e),
                            }
                        }
                    },
                }
            }
            (Err(e), Some(cached)) => {
                warn!(source = %source.label(), "Schedule fetch failed, falling back to cache: {}", e);
                cached
            }
            (Err(e), None) => return self.unavailable(source, &e.to_string()),
        };

        let version = Arc::new(version);
        self.publish(version.clone());
        Ok(version)
    }

    fn unavailable(&self, source: &ScheduleSource, reason: &str) -> Result<Arc<ScheduleVersion>, ScheduleError> {
        error!(source = %source.label(), "Schedule unavailable: {}", reason);
        Err(ScheduleError::ScheduleUnavailable(format!("{}: {}", source.label(), reason)))
    }

    async fn obtain(
        &self,
        source: &ScheduleSource,
        validators: Option<&ConditionalHeaders>,
    ) -> Result<Obtained, ScheduleError> {
        match source {
            ScheduleSource::Url(url) => {
                let fetcher = self
                    .fetcher
                    .as_ref()
                    .ok_or_else(|| ScheduleError::ScheduleUnavailable("no HTTP client configured".to_string()))?;
                info!(url = %url, "Downloading schedule archive");
                match fetcher.fetch(url, validators, MAX_ARCHIVE_BYTES).await? {
                    FetchOutcome::NotModified => Ok(Obtained::NotModified),
                    FetchOutcome::Fetched { body, validators } => Ok(Obtained::Archive {
                        data: body.to_vec(),
                        validators,
                    }),
                }
            }
            ScheduleSource::File(path) => {
                let data = tokio::fs::read(path).await.map_err(|e| {
                    ScheduleError::Archive(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Ok(Obtained::Archive {
                    data,
                    validators: ConditionalHeaders::default(),
                })
            }
            ScheduleSource::Bytes { data, .. } => Ok(Obtained::Archive {
                data: data.clone(),
                validators: ConditionalHeaders::default(),
            }),
        }
    }

    fn parse(
        &self,
        source: &ScheduleSource,
        data: &[u8],
        content_hash: String,
        validators: ConditionalHeaders,
    ) -> Result<ScheduleVersion, ScheduleError> {
        debug!(bytes = data.len(), "Parsing schedule archive");
        let tables = gtfs_static::parse_archive(data)?;
        let info = ScheduleVersionInfo {
            content_hash,
            source: source.label(),
            fetched_at: Utc::now().timestamp(),
            timezone: self.fallback_timezone.name().to_string(),
            etag: validators.etag,
            last_modified: validators.last_modified,
            trips: 0,
            entries: 0,
            routes: 0,
        };
        ScheduleVersion::from_tables(tables, self.fallback_timezone, info)
    }

    fn read_cache(&self) -> Option<ScheduleVersion> {
        let path = self.cache_path();
        if !path.exists() {
            debug!(path = %path.display(), "No schedule cache found");
            return None;
        }
        match load_cache_file(&path) {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable schedule cache: {}", e);
                None
            }
        }
    }

    fn write_cache(&self, version: &ScheduleVersion) {
        let path = self.cache_path();
        if let Err(e) = save_cache_file(&path, version) {
            // the parsed version is still usable; only the next start pays
            warn!(path = %path.display(), "Failed to write schedule cache: {}", e);
        } else {
            debug!(path = %path.display(), "Schedule cache saved");
        }
    }
}

pub fn content_hash(data: &[u8]) -> String {
    format!("{:016x}", seahash::hash(data))
}

fn load_cache_file(path: &Path) -> Result<ScheduleVersion, ScheduleError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ScheduleError::Cache(format!("Failed to read cache: {}", e)))?;
    let cached: CachedSchedule = serde_json::from_str(&contents)
        .map_err(|e| ScheduleError::Cache(format!("Failed to parse cache: {}", e)))?;
    ScheduleVersion::from_cached(cached)
}

fn save_cache_file(path: &Path, version: &ScheduleVersion) -> Result<(), ScheduleError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| ScheduleError::Cache(format!("Failed to create cache dir: {}", e)))?;
    }
    let json = serde_json::to_string(&version.to_cached())
        .map_err(|e| ScheduleError::Cache(format!("Failed to serialize cache: {}", e)))?;

    // write-then-rename so a crash never leaves a truncated cache behind
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| ScheduleError::Cache(format!("Failed to write cache: {}", e)))?;
    std::fs::rename(&tmp, path).map_err(|e| ScheduleError::Cache(format!("Failed to move cache: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn store(label: &str) -> ScheduleStore {
        let config = ScheduleConfig {
            cache_dir: Some(scratch_dir(label)),
            ..ScheduleConfig::default()
        };
        ScheduleStore::new(config, chrono_tz::America::Edmonton, None)
    }

    fn sample_source() -> ScheduleSource {
        ScheduleSource::Bytes {
            label: "sample".to_string(),
            data: sample_archive(),
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp()
    }

    #[tokio::test]
    async fn loads_and_indexes_sample_archive() {
        let store = store("schedule_index");
        let version = store.load(&sample_source()).await.unwrap();

        assert_eq!(version.origin(), VersionOrigin::Parsed);
        assert_eq!(version.timezone(), chrono_tz::America::Edmonton);
        assert_eq!(version.len(), 5);

        let entry = store.lookup("t1", 2).unwrap();
        assert_eq!(entry.stop_id, "s2");
        assert_eq!(entry.route_id.as_deref(), Some("8"));
        assert_eq!(entry.arrival_secs, 8 * 3600 + 600);

        assert!(store.lookup("t1", 9).is_none());
        assert!(store.lookup("nope", 1).is_none());
        assert_eq!(version.lookup_by_stop("t2", "s3").unwrap().stop_sequence, 2);

        let route_9: Vec<(String, u32)> = store
            .lookup_by_route("9")
            .into_iter()
            .map(|e| (e.trip_id, e.stop_sequence))
            .collect();
        assert_eq!(
            route_9,
            vec![("owl".to_string(), 1), ("t2".to_string(), 1), ("t2".to_string(), 2)]
        );
        assert!(store.lookup_by_route("missing").is_empty());
    }

    #[test]
    fn past_midnight_time_lands_on_next_day_across_dst() {
        let tz = chrono_tz::America::Edmonton;

        // Saturday before DST starts (2024-03-10 02:00 MST -> MDT).
        // Service day reference is 2024-03-09 00:00 MST = 07:00Z.
        let epoch = service_time_to_epoch(tz, ymd(2024, 3, 9), 25 * 3600 + 30 * 60).unwrap();
        assert_eq!(epoch, utc("2024-03-10T08:30:00Z"));

        // On the transition day itself the reference is noon MDT minus 12h
        // (06:00Z), one hour off from local midnight.
        let morning = service_time_to_epoch(tz, ymd(2024, 3, 10), 8 * 3600).unwrap();
        assert_eq!(morning, utc("2024-03-10T14:00:00Z"));
        let late = service_time_to_epoch(tz, ymd(2024, 3, 10), 25 * 3600 + 30 * 60).unwrap();
        assert_eq!(late, utc("2024-03-11T07:30:00Z"));
    }

    #[test]
    fn fall_back_day_uses_noon_reference() {
        let tz = chrono_tz::America::Edmonton;
        // 2024-11-03: noon MST = 19:00Z, reference = 07:00Z (00:00 MST,
        // although local midnight was 06:00Z in MDT).
        let epoch = service_time_to_epoch(tz, ymd(2024, 11, 3), 8 * 3600).unwrap();
        assert_eq!(epoch, utc("2024-11-03T15:00:00Z"));
    }

    #[tokio::test]
    async fn service_day_inferred_from_observation() {
        let store = store("schedule_service_day");
        let version = store.load(&sample_source()).await.unwrap();
        let owl = version.lookup("owl", 1).unwrap().clone();

        // Observed 01:35 MDT on 2024-06-12 -> the owl trip belongs to 06-11.
        let observed = utc("2024-06-12T07:35:00Z");
        assert_eq!(version.resolve_service_day(&owl, None, observed), Some(ymd(2024, 6, 11)));

        // An explicit start date always wins.
        assert_eq!(
            version.resolve_service_day(&owl, Some(ymd(2024, 6, 12)), observed),
            Some(ymd(2024, 6, 12))
        );
    }

    #[tokio::test]
    async fn calendar_dates_override_calendar() {
        let dates = "service_id,date,exception_type\nWKDY,20240701,2\nHOLIDAY,20240701,1\n";
        let archive = gtfs_zip(&[
            ("agency.txt", AGENCY_TXT),
            ("routes.txt", ROUTES_TXT),
            ("trips.txt", TRIPS_TXT),
            ("stops.txt", STOPS_TXT),
            ("stop_times.txt", STOP_TIMES_TXT),
            ("calendar.txt", CALENDAR_TXT),
            ("calendar_dates.txt", dates),
        ]);
        let store = store("schedule_calendar_dates");
        let version = store
            .load(&ScheduleSource::Bytes { label: "holiday".into(), data: archive })
            .await
            .unwrap();

        assert!(!version.is_service_active("WKDY", ymd(2024, 7, 1)));
        assert!(version.is_service_active("WKDY", ymd(2024, 7, 2)));
        assert!(version.is_service_active("HOLIDAY", ymd(2024, 7, 1)));
        assert!(!version.is_service_active("WKDY", ymd(2025, 1, 1)));
    }

    #[tokio::test]
    async fn unchanged_content_reuses_cache_across_restarts() {
        let dir = scratch_dir("schedule_cache_reuse");
        let config = ScheduleConfig {
            cache_dir: Some(dir.clone()),
            ..ScheduleConfig::default()
        };

        let first = ScheduleStore::new(config.clone(), chrono_tz::America::Edmonton, None);
        let parsed = first.load(&sample_source()).await.unwrap();
        assert_eq!(parsed.origin(), VersionOrigin::Parsed);
        assert!(dir.join(CACHE_FILE_NAME).exists());

        // simulated restart with an identical upstream archive
        let second = ScheduleStore::new(config.clone(), chrono_tz::America::Edmonton, None);
        let reused = second.load(&sample_source()).await.unwrap();
        assert_eq!(reused.origin(), VersionOrigin::Cache);
        assert_eq!(reused.info().content_hash, parsed.info().content_hash);
        assert_eq!(second.lookup("t1", 1).unwrap().stop_id, "s1");

        // startup within the refresh interval never contacts the source
        let third = ScheduleStore::new(config, chrono_tz::America::Edmonton, None);
        let unreachable = ScheduleSource::Url("http://127.0.0.1:9/gtfs.zip".to_string());
        let initial = third.initialize(&unreachable).await.unwrap();
        assert_eq!(initial.origin(), VersionOrigin::Cache);
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_cache() {
        let dir = scratch_dir("schedule_cache_fallback");
        let config = ScheduleConfig {
            cache_dir: Some(dir.clone()),
            ..ScheduleConfig::default()
        };
        let store = ScheduleStore::new(config, chrono_tz::America::Edmonton, None);
        store.load(&sample_source()).await.unwrap();

        let missing = ScheduleSource::File(dir.join("does_not_exist.zip"));
        let version = store.load(&missing).await.unwrap();
        assert_eq!(version.origin(), VersionOrigin::Cache);
    }

    #[tokio::test]
    async fn no_fetch_and_no_cache_is_unavailable() {
        let store = store("schedule_unavailable");
        let missing = ScheduleSource::File(PathBuf::from("/nonexistent/gtfs.zip"));
        assert!(matches!(
            store.load(&missing).await,
            Err(ScheduleError::ScheduleUnavailable(_))
        ));
        assert!(store.active().is_none());
    }

    #[tokio::test]
    async fn swapping_versions_keeps_readers_consistent() {
        let store = store("schedule_swap");
        let old = store.load(&sample_source()).await.unwrap();

        let reduced = gtfs_zip(&[
            ("routes.txt", ROUTES_TXT),
            ("trips.txt", TRIPS_TXT),
            ("stops.txt", STOPS_TXT),
            ("stop_times.txt", "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nt2,09:00:00,09:00:00,s2,1\n"),
        ]);
        store
            .load(&ScheduleSource::Bytes { label: "v2".into(), data: reduced })
            .await
            .unwrap();

        // the reader holding the old version still sees it in full
        assert!(old.lookup("t1", 1).is_some());
        assert!(store.lookup("t1", 1).is_none());
        assert_eq!(store.lookup("t2", 1).unwrap().arrival_secs, 9 * 3600);
    }

    #[actix_web::test]
    async fn not_modified_upstream_reuses_cached_parse() {
        use crate::config::FetchConfig;
        use crate::test_support::{ScriptedResponse, ScriptedServer};

        let upstream = ScriptedServer::start(vec![
            ScriptedResponse::new(200, sample_archive()).with_etag("\"v1\""),
            ScriptedResponse::new(304, ""),
        ]);
        let config = ScheduleConfig {
            cache_dir: Some(scratch_dir("schedule_not_modified")),
            ..ScheduleConfig::default()
        };
        let fetcher = HttpFetcher::new(FetchConfig {
            initial_backoff_ms: 1,
            ..FetchConfig::default()
        })
        .unwrap();
        let source = ScheduleSource::Url(upstream.url.clone());

        let first = ScheduleStore::new(config.clone(), chrono_tz::America::Edmonton, Some(fetcher.clone()))
            .load(&source)
            .await
            .unwrap();
        assert_eq!(first.origin(), VersionOrigin::Parsed);
        assert_eq!(first.info().etag.as_deref(), Some("\"v1\""));

        // a new store only has the on-disk cache to go on
        let restarted = ScheduleStore::new(config, chrono_tz::America::Edmonton, Some(fetcher));
        let second = restarted.load(&source).await.unwrap();
        assert_eq!(second.origin(), VersionOrigin::Cache);
        assert_eq!(second.info().content_hash, first.info().content_hash);
        assert_eq!(restarted.lookup("t1", 2).unwrap().stop_id, "s2");
        assert_eq!(upstream.if_none_match(), vec![None, Some("\"v1\"".to_string())]);
        upstream.stop().await;
    }
}
