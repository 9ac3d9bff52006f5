// Fixtures shared by the unit tests: hand-built GTFS-RT payloads,
// in-memory GTFS archives and a scripted HTTP upstream.

use std::io::{Cursor, Write};
use std::sync::Mutex;

use actix_web::dev::ServerHandle;
use actix_web::http::{header, StatusCode};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

use gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use gtfs_rt::{
    FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
    VehiclePosition,
};
use prost::Message;
use zip::write::FileOptions;
use zip::ZipWriter;

pub fn feed_message(header_timestamp: u64, entity: Vec<FeedEntity>) -> Vec<u8> {
    FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(header_timestamp),
            ..Default::default()
        },
        entity,
    }
    .encode_to_vec()
}

pub fn vehicle_entity(
    entity_id: &str,
    vehicle_id: &str,
    trip_id: Option<&str>,
    latitude: f32,
    longitude: f32,
    timestamp: Option<u64>,
) -> FeedEntity {
    FeedEntity {
        id: entity_id.to_string(),
        vehicle: Some(VehiclePosition {
            trip: trip_id.map(|t| TripDescriptor {
                trip_id: Some(t.to_string()),
                ..Default::default()
            }),
            vehicle: Some(VehicleDescriptor {
                id: Some(vehicle_id.to_string()),
                ..Default::default()
            }),
            position: Some(Position {
                latitude,
                longitude,
                bearing: Some(90.0),
                speed: Some(8.5),
                ..Default::default()
            }),
            timestamp,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn stop_time_update(
    stop_sequence: Option<u32>,
    stop_id: Option<&str>,
    arrival: Option<i64>,
    departure: Option<i64>,
) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_sequence,
        stop_id: stop_id.map(str::to_string),
        arrival: arrival.map(|time| StopTimeEvent {
            time: Some(time),
            ..Default::default()
        }),
        departure: departure.map(|time| StopTimeEvent {
            time: Some(time),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn trip_update_entity(
    entity_id: &str,
    trip_id: &str,
    route_id: Option<&str>,
    updates: Vec<StopTimeUpdate>,
) -> FeedEntity {
    FeedEntity {
        id: entity_id.to_string(),
        trip_update: Some(TripUpdate {
            trip: TripDescriptor {
                trip_id: Some(trip_id.to_string()),
                route_id: route_id.map(str::to_string),
                ..Default::default()
            },
            stop_time_update: updates,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds a GTFS zip archive from `(file name, contents)` pairs.
pub fn gtfs_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub const AGENCY_TXT: &str = "agency_id,agency_name,agency_url,agency_timezone\n\
ETS,Edmonton Transit Service,https://www.edmonton.ca/ets,America/Edmonton\n";

pub const ROUTES_TXT: &str = "route_id,route_short_name,route_long_name,route_type\n\
8,8,Abbottsfield - Coliseum,3\n\
9,9,Eaux Claires - Southgate,3\n";

pub const TRIPS_TXT: &str = "route_id,service_id,trip_id,trip_headsign\n\
8,WKDY,t1,Coliseum\n\
9,WKDY,t2,Southgate\n\
9,WKDY,owl,Southgate\n";

pub const STOPS_TXT: &str = "stop_id,stop_name,stop_lat,stop_lon\n\
s1,Jasper Ave,53.5410,-113.4930\n\
s2,101 St,53.5420,-113.4940\n\
s3,Churchill,53.5440,-113.4890\n";

pub const STOP_TIMES_TXT: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
t1,08:00:00,08:00:30,s1,1\n\
t1,08:10:00,08:10:30,s2,2\n\
t2,08:05:00,08:05:00,s2,1\n\
t2,08:15:00,08:15:00,s3,2\n\
owl,25:30:00,25:30:00,s3,1\n";

pub const CALENDAR_TXT: &str = "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
WKDY,1,1,1,1,1,1,1,20240101,20241231\n";

/// A small but complete Edmonton-style archive.
pub fn sample_archive() -> Vec<u8> {
    gtfs_zip(&[
        ("agency.txt", AGENCY_TXT),
        ("routes.txt", ROUTES_TXT),
        ("trips.txt", TRIPS_TXT),
        ("stops.txt", STOPS_TXT),
        ("stop_times.txt", STOP_TIMES_TXT),
        ("calendar.txt", CALENDAR_TXT),
    ])
}

/// Unique scratch directory under the system temp dir.
pub fn scratch_dir(label: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let dir = std::env::temp_dir().join(format!(
        "transit_pipeline_{}_{}_{}",
        label,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ============================================================================
// Scripted Upstream
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            etag: None,
            body: body.into(),
        }
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }
}

struct Script {
    responses: Vec<ScriptedResponse>,
    /// `If-None-Match` of every request received, in order
    requests: Mutex<Vec<Option<String>>>,
}

/// Local HTTP server answering request n with response n; the last
/// response repeats once the script runs out.
pub struct ScriptedServer {
    pub url: String,
    script: web::Data<Script>,
    handle: ServerHandle,
}

impl ScriptedServer {
    /// Must be called from inside an actix system (`#[actix_web::test]`).
    pub fn start(responses: Vec<ScriptedResponse>) -> Self {
        let script = web::Data::new(Script {
            responses,
            requests: Mutex::new(Vec::new()),
        });

        let data = script.clone();
        let server = HttpServer::new(move || App::new().app_data(data.clone()).default_service(web::to(scripted)))
            .workers(1)
            .disable_signals()
            .bind(("127.0.0.1", 0))
            .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            url: format!("http://{}/resource", addr),
            script,
            handle,
        }
    }

    pub fn hits(&self) -> usize {
        self.script.requests.lock().unwrap().len()
    }

    pub fn if_none_match(&self) -> Vec<Option<String>> {
        self.script.requests.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

async fn scripted(req: HttpRequest, script: web::Data<Script>) -> HttpResponse {
    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let index = {
        let mut requests = script.requests.lock().unwrap();
        requests.push(if_none_match);
        requests.len() - 1
    };

    let Some(response) = script.responses.get(index).or(script.responses.last()) else {
        return HttpResponse::NotFound().finish();
    };
    let mut builder = HttpResponse::build(StatusCode::from_u16(response.status).unwrap());
    if let Some(etag) = &response.etag {
        builder.insert_header((header::ETAG, etag.clone()));
    }
    builder.body(response.body.clone())
}
