// ============================================================================
// Static GTFS Archive Parsing
// ============================================================================
//
// Tables are read by column name, so feeds that reorder or add columns parse
// the same. Rows missing a required column are skipped and counted; a table
// that is required but absent rejects the whole archive.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::ScheduleError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    pub agency_id: Option<String>,
    pub agency_name: String,
    pub agency_timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    /// Seconds past the service day's reference midnight, may exceed 24h.
    pub arrival_secs: u32,
    pub departure_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: String,
    /// Monday first.
    pub weekdays: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionType {
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarDate {
    pub service_id: String,
    pub date: NaiveDate,
    pub exception_type: ExceptionType,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleTables {
    pub agencies: Vec<Agency>,
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stops: Vec<Stop>,
    pub stop_times: Vec<StopTime>,
    pub calendar: Vec<ServiceCalendar>,
    pub calendar_dates: Vec<CalendarDate>,
    pub skipped_rows: usize,
}

impl ScheduleTables {
    /// Timezone declared by the first agency, if any.
    pub fn agency_timezone(&self) -> Option<&str> {
        self.agencies
            .iter()
            .map(|a| a.agency_timezone.as_str())
            .find(|tz| !tz.is_empty())
    }
}

/// Parses a zipped GTFS schedule.
pub fn parse_archive(data: &[u8]) -> Result<ScheduleTables, ScheduleError> {
    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| ScheduleError::Archive(format!("Failed to open GTFS zip archive: {}", e)))?;

    let mut tables = ScheduleTables::default();

    if let Some(contents) = read_table(&mut archive, "agency.txt", false)? {
        tables.agencies = parse_rows(&contents, "agency.txt", &mut tables.skipped_rows, |row| {
            Some(Agency {
                agency_id: row.optional("agency_id"),
                agency_name: row.get("agency_name").unwrap_or_default().to_string(),
                agency_timezone: row.get("agency_timezone")?.to_string(),
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "routes.txt", true)? {
        tables.routes = parse_rows(&contents, "routes.txt", &mut tables.skipped_rows, |row| {
            Some(Route {
                route_id: row.get("route_id")?.to_string(),
                route_short_name: row.optional("route_short_name"),
                route_long_name: row.optional("route_long_name"),
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "trips.txt", true)? {
        tables.trips = parse_rows(&contents, "trips.txt", &mut tables.skipped_rows, |row| {
            Some(Trip {
                trip_id: row.get("trip_id")?.to_string(),
                route_id: row.get("route_id")?.to_string(),
                service_id: row.get("service_id")?.to_string(),
                trip_headsign: row.optional("trip_headsign"),
                direction_id: row.get("direction_id").and_then(|s| s.parse().ok()),
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "stops.txt", true)? {
        tables.stops = parse_rows(&contents, "stops.txt", &mut tables.skipped_rows, |row| {
            Some(Stop {
                stop_id: row.get("stop_id")?.to_string(),
                stop_name: row.get("stop_name").unwrap_or_default().to_string(),
                stop_lat: row.get("stop_lat").and_then(|s| s.parse().ok()),
                stop_lon: row.get("stop_lon").and_then(|s| s.parse().ok()),
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "stop_times.txt", true)? {
        tables.stop_times = parse_rows(&contents, "stop_times.txt", &mut tables.skipped_rows, |row| {
            let arrival = row.get("arrival_time").and_then(parse_gtfs_time);
            let departure = row.get("departure_time").and_then(parse_gtfs_time);
            // timepoints may leave one side blank
            let (arrival_secs, departure_secs) = match (arrival, departure) {
                (Some(a), Some(d)) => (a, d),
                (Some(a), None) => (a, a),
                (None, Some(d)) => (d, d),
                (None, None) => return None,
            };
            Some(StopTime {
                trip_id: row.get("trip_id")?.to_string(),
                stop_id: row.get("stop_id")?.to_string(),
                stop_sequence: row.get("stop_sequence")?.parse().ok()?,
                arrival_secs,
                departure_secs,
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "calendar.txt", false)? {
        tables.calendar = parse_rows(&contents, "calendar.txt", &mut tables.skipped_rows, |row| {
            let day = |name: &str| row.get(name) == Some("1");
            Some(ServiceCalendar {
                service_id: row.get("service_id")?.to_string(),
                weekdays: [
                    day("monday"),
                    day("tuesday"),
                    day("wednesday"),
                    day("thursday"),
                    day("friday"),
                    day("saturday"),
                    day("sunday"),
                ],
                start_date: parse_gtfs_date(row.get("start_date")?)?,
                end_date: parse_gtfs_date(row.get("end_date")?)?,
            })
        })?;
    }

    if let Some(contents) = read_table(&mut archive, "calendar_dates.txt", false)? {
        tables.calendar_dates = parse_rows(&contents, "calendar_dates.txt", &mut tables.skipped_rows, |row| {
            let exception_type = match row.get("exception_type")? {
                "1" => ExceptionType::Added,
                "2" => ExceptionType::Removed,
                _ => return None,
            };
            Some(CalendarDate {
                service_id: row.get("service_id")?.to_string(),
                date: parse_gtfs_date(row.get("date")?)?,
                exception_type,
            })
        })?;
    }

    if tables.skipped_rows > 0 {
        warn!(skipped = tables.skipped_rows, "Skipped malformed schedule rows");
    }
    debug!(
        routes = tables.routes.len(),
        trips = tables.trips.len(),
        stops = tables.stops.len(),
        stop_times = tables.stop_times.len(),
        "Parsed GTFS archive"
    );

    Ok(tables)
}

fn read_table(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &'static str,
    required: bool,
) -> Result<Option<String>, ScheduleError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(_) if required => return Err(ScheduleError::MissingTable(name)),
        Err(_) => return Ok(None),
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(|e| ScheduleError::Parse {
        table: name,
        reason: e.to_string(),
    })?;
    Ok(Some(contents))
}

/// One CSV row with columns resolved through the header.
struct Row<'a> {
    columns: &'a HashMap<String, usize>,
    record: &'a csv::StringRecord,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a str> {
        let index = *self.columns.get(column)?;
        self.record.get(index).map(str::trim)
    }

    fn optional(&self, column: &str) -> Option<String> {
        self.get(column).filter(|s| !s.is_empty()).map(str::to_string)
    }
}

fn parse_rows<T>(
    contents: &str,
    table: &'static str,
    skipped: &mut usize,
    parse: impl Fn(&Row<'_>) -> Option<T>,
) -> Result<Vec<T>, ScheduleError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_bytes());

    let columns: HashMap<String, usize> = reader
        .headers()
        .map_err(|e| ScheduleError::Parse {
            table,
            reason: e.to_string(),
        })?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim_start_matches('\u{feff}').trim().to_string(), i))
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let parsed = result.ok().and_then(|record| {
            parse(&Row {
                columns: &columns,
                record: &record,
            })
        });
        match parsed {
            Some(row) => rows.push(row),
            None => *skipped += 1,
        }
    }
    Ok(rows)
}

/// Parses `H:MM:SS` into seconds. Hours past 23 are valid.
pub fn parse_gtfs_time(time_str: &str) -> Option<u32> {
    let mut parts = time_str.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

pub fn parse_gtfs_date(date_str: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date_str.trim(), "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn parses_sample_archive() {
        let tables = parse_archive(&sample_archive()).unwrap();
        assert_eq!(tables.agency_timezone(), Some("America/Edmonton"));
        assert_eq!(tables.routes.len(), 2);
        assert_eq!(tables.trips.len(), 3);
        assert_eq!(tables.stops.len(), 3);
        assert_eq!(tables.stop_times.len(), 5);
        assert_eq!(tables.calendar.len(), 1);
        assert!(tables.calendar_dates.is_empty());
        assert_eq!(tables.skipped_rows, 0);

        let owl = tables.stop_times.iter().find(|st| st.trip_id == "owl").unwrap();
        assert_eq!(owl.arrival_secs, 25 * 3600 + 30 * 60);
    }

    #[test]
    fn columns_are_located_by_name() {
        let reordered = "stop_sequence,stop_id,departure_time,arrival_time,trip_id,pickup_type\n\
            1,s1,08:00:30,08:00:00,t1,0\n";
        let archive = gtfs_zip(&[
            ("routes.txt", ROUTES_TXT),
            ("trips.txt", TRIPS_TXT),
            ("stops.txt", STOPS_TXT),
            ("stop_times.txt", reordered),
        ]);
        let tables = parse_archive(&archive).unwrap();
        let stop_time = &tables.stop_times[0];
        assert_eq!(stop_time.trip_id, "t1");
        assert_eq!(stop_time.arrival_secs, 8 * 3600);
        assert_eq!(stop_time.departure_secs, 8 * 3600 + 30);
    }

    #[test]
    fn missing_required_table_rejects_archive() {
        let archive = gtfs_zip(&[
            ("routes.txt", ROUTES_TXT),
            ("trips.txt", TRIPS_TXT),
            ("stops.txt", STOPS_TXT),
        ]);
        assert!(matches!(
            parse_archive(&archive),
            Err(ScheduleError::MissingTable("stop_times.txt"))
        ));
    }

    #[test]
    fn not_a_zip_is_an_archive_error() {
        assert!(matches!(parse_archive(b"PK nope"), Err(ScheduleError::Archive(_))));
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let stop_times = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
            t1,08:00:00,08:00:00,s1,1\n\
            t1,eight,eight,s2,2\n\
            t1,08:20:00,08:20:00,s3,x\n";
        let archive = gtfs_zip(&[
            ("routes.txt", ROUTES_TXT),
            ("trips.txt", TRIPS_TXT),
            ("stops.txt", STOPS_TXT),
            ("stop_times.txt", stop_times),
        ]);
        let tables = parse_archive(&archive).unwrap();
        assert_eq!(tables.stop_times.len(), 1);
        assert_eq!(tables.skipped_rows, 2);
    }

    #[test]
    fn gtfs_time_allows_hours_past_midnight() {
        assert_eq!(parse_gtfs_time("25:30:00"), Some(91_800));
        assert_eq!(parse_gtfs_time("7:05:09"), Some(25_509));
        assert_eq!(parse_gtfs_time("08:61:00"), None);
        assert_eq!(parse_gtfs_time("08:00"), None);
    }
}
