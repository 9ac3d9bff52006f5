// GTFS-RT decoding for the two live feeds (vehicle positions, trip updates).
//
// A payload either decodes as a whole or is rejected as a whole: a corrupt
// header or framing error invalidates every entity in it. Individual bad
// entities inside a well-formed payload are skipped and reported as warnings.

use chrono::NaiveDate;
use gtfs_rt::FeedMessage;
use prost::Message;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::models::{
    FeedKind, OccupancyStatus, ScheduleRelationship, StopTimeUpdateRecord, TripUpdateRecord,
    VehiclePositionRecord,
};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 50 * 1024 * 1024;

/// One skipped entity inside an otherwise valid payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDecodeWarning {
    pub entity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFeed<T> {
    pub kind: FeedKind,
    pub header_timestamp: Option<i64>,
    pub records: Vec<T>,
    pub warnings: Vec<EntityDecodeWarning>,
}

impl<T> DecodedFeed<T> {
    /// Result used when a feed could not be fetched or decoded this cycle.
    pub fn empty(kind: FeedKind) -> Self {
        Self {
            kind,
            header_timestamp: None,
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedDecoder {
    max_payload_bytes: usize,
}

impl Default for FeedDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl FeedDecoder {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn decode_vehicle_positions(
        &self,
        payload: &[u8],
    ) -> Result<DecodedFeed<VehiclePositionRecord>, FeedError> {
        let kind = FeedKind::VehiclePositions;
        let feed = self.decode_message(kind, payload)?;
        let header_timestamp = header_timestamp(&feed);

        let mut records = Vec::new();
        let mut warnings = Vec::new();

        for entity in feed.entity {
            if entity.is_deleted.unwrap_or(false) {
                continue;
            }
            let Some(vehicle) = entity.vehicle else {
                continue;
            };

            let vehicle_id = vehicle
                .vehicle
                .as_ref()
                .and_then(|v| v.id.clone())
                .filter(|id| !id.is_empty())
                .or_else(|| Some(entity.id.clone()).filter(|id| !id.is_empty()));

            let Some(vehicle_id) = vehicle_id else {
                warnings.push(skip(kind, &entity.id, "no vehicle identifier"));
                continue;
            };

            let Some(position) = vehicle.position.as_ref() else {
                warnings.push(skip(kind, &entity.id, "no position"));
                continue;
            };

            let timestamp = match vehicle.timestamp {
                Some(ts) => i64::try_from(ts).ok(),
                None => header_timestamp,
            };
            let Some(timestamp) = timestamp else {
                warnings.push(skip(kind, &entity.id, "no capture timestamp"));
                continue;
            };

            let trip_id = vehicle
                .trip
                .as_ref()
                .and_then(|t| t.trip_id.clone());

            let route_id = vehicle
                .trip
                .as_ref()
                .and_then(|t| t.route_id.clone())
                .filter(|r| !r.is_empty());

            records.push(VehiclePositionRecord {
                vehicle_id,
                trip_id,
                route_id,
                latitude: position.latitude as f64,
                longitude: position.longitude as f64,
                bearing: position.bearing,
                speed: position.speed,
                timestamp,
                occupancy_status: vehicle.occupancy_status.and_then(OccupancyStatus::from_wire),
                current_stop_sequence: vehicle.current_stop_sequence,
                stop_id: vehicle.stop_id.clone().filter(|s| !s.is_empty()),
                current_status: vehicle.current_status,
                congestion_level: vehicle.congestion_level,
            });
        }

        debug!(feed = %kind, records = records.len(), skipped = warnings.len(), "Decoded feed");

        Ok(DecodedFeed {
            kind,
            header_timestamp,
            records,
            warnings,
        })
    }

    pub fn decode_trip_updates(
        &self,
        payload: &[u8],
    ) -> Result<DecodedFeed<TripUpdateRecord>, FeedError> {
        let kind = FeedKind::TripUpdates;
        let feed = self.decode_message(kind, payload)?;
        let header_timestamp = header_timestamp(&feed);

        let mut records = Vec::new();
        let mut warnings = Vec::new();

        for entity in feed.entity {
            if entity.is_deleted.unwrap_or(false) {
                continue;
            }
            let Some(trip_update) = entity.trip_update else {
                continue;
            };

            let Some(trip_id) = trip_update.trip.trip_id.clone().filter(|t| !t.is_empty()) else {
                warnings.push(skip(kind, &entity.id, "no trip identifier"));
                continue;
            };

            let timestamp = header_timestamp
                .or_else(|| trip_update.timestamp.and_then(|ts| i64::try_from(ts).ok()));
            let Some(timestamp) = timestamp else {
                warnings.push(skip(kind, &entity.id, "no capture timestamp"));
                continue;
            };

            let start_date = match trip_update.trip.start_date.as_deref() {
                None | Some("") => None,
                Some(raw) => match NaiveDate::parse_from_str(raw, "%Y%m%d") {
                    Ok(date) => Some(date),
                    Err(_) => {
                        warnings.push(skip(
                            kind,
                            &entity.id,
                            &format!("unparsable start_date {:?}, ignored", raw),
                        ));
                        None
                    }
                },
            };

            let mut stop_time_updates = Vec::with_capacity(trip_update.stop_time_update.len());
            for stu in &trip_update.stop_time_update {
                let stop_id = stu.stop_id.clone().filter(|s| !s.is_empty());
                if stop_id.is_none() && stu.stop_sequence.is_none() {
                    warnings.push(skip(kind, &entity.id, "stop time update without stop id or sequence"));
                    continue;
                }

                stop_time_updates.push(StopTimeUpdateRecord {
                    stop_sequence: stu.stop_sequence,
                    stop_id,
                    predicted_arrival: stu.arrival.as_ref().and_then(|e| e.time),
                    predicted_departure: stu.departure.as_ref().and_then(|e| e.time),
                    arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
                    departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
                    schedule_relationship: ScheduleRelationship::from_wire(stu.schedule_relationship),
                });
            }

            records.push(TripUpdateRecord {
                trip_id,
                route_id: trip_update.trip.route_id.clone().filter(|r| !r.is_empty()),
                vehicle_id: trip_update.vehicle.as_ref().and_then(|v| v.id.clone()),
                start_date,
                stop_time_updates,
                timestamp,
            });
        }

        debug!(feed = %kind, records = records.len(), skipped = warnings.len(), "Decoded feed");

        Ok(DecodedFeed {
            kind,
            header_timestamp,
            records,
            warnings,
        })
    }

    fn decode_message(&self, kind: FeedKind, payload: &[u8]) -> Result<FeedMessage, FeedError> {
        if payload.len() > self.max_payload_bytes {
            return Err(FeedError::MalformedFeed {
                kind,
                reason: format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    payload.len(),
                    self.max_payload_bytes
                ),
            });
        }

        let feed = FeedMessage::decode(payload).map_err(|e| FeedError::MalformedFeed {
            kind,
            reason: format!("protobuf decode failed: {}", e),
        })?;

        let version = feed.header.gtfs_realtime_version.trim();
        let major = version.split('.').next().unwrap_or_default();
        if major != "1" && major != "2" {
            return Err(FeedError::MalformedFeed {
                kind,
                reason: format!("unsupported gtfs_realtime_version {:?}", version),
            });
        }

        Ok(feed)
    }
}

fn header_timestamp(feed: &FeedMessage) -> Option<i64> {
    feed.header.timestamp.and_then(|ts| i64::try_from(ts).ok())
}

fn skip(kind: FeedKind, entity_id: &str, reason: &str) -> EntityDecodeWarning {
    warn!(feed = %kind, entity_id, reason, "Skipping malformed entity");
    EntityDecodeWarning {
        entity_id: entity_id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{feed_message, stop_time_update, trip_update_entity, vehicle_entity};
    use gtfs_rt::{FeedEntity, FeedHeader, Position, VehiclePosition};

    #[test]
    fn decodes_vehicle_positions() {
        let payload = feed_message(
            1_700_000_000,
            vec![
                vehicle_entity("e1", "v1", Some("t1"), 53.54, -113.49, Some(1_700_000_010)),
                vehicle_entity("e2", "v2", None, 53.55, -113.50, None),
            ],
        );

        let decoded = FeedDecoder::default().decode_vehicle_positions(&payload).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert!(decoded.warnings.is_empty());
        assert_eq!(decoded.records[0].vehicle_id, "v1");
        assert_eq!(decoded.records[0].trip_id.as_deref(), Some("t1"));
        assert_eq!(decoded.records[0].timestamp, 1_700_000_010);
        // falls back to the header timestamp
        assert_eq!(decoded.records[1].timestamp, 1_700_000_000);
        assert!((decoded.records[1].latitude - 53.55).abs() < 1e-4);
    }

    #[test]
    fn decode_is_idempotent_and_leaves_input_untouched() {
        let payload = feed_message(
            1_700_000_000,
            vec![vehicle_entity("e1", "v1", Some("t1"), 53.54, -113.49, None)],
        );
        let before = payload.clone();
        let decoder = FeedDecoder::default();

        let first = decoder.decode_vehicle_positions(&payload).unwrap();
        let second = decoder.decode_vehicle_positions(&payload).unwrap();
        assert_eq!(first, second);
        assert_eq!(payload, before);
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let payload = feed_message(
            1_700_000_000,
            vec![vehicle_entity("e1", "v1", Some("t1"), 53.54, -113.49, None)],
        );
        let truncated = &payload[..payload.len() - 3];

        let result = FeedDecoder::default().decode_vehicle_positions(truncated);
        assert!(matches!(result, Err(FeedError::MalformedFeed { .. })));
    }

    #[test]
    fn garbage_and_empty_buffers_are_malformed() {
        let decoder = FeedDecoder::default();
        assert!(decoder.decode_trip_updates(&[0xff, 0xff, 0xff, 0x01]).is_err());
        // an empty buffer decodes to a header without a version
        assert!(decoder.decode_trip_updates(&[]).is_err());
    }

    #[test]
    fn unsupported_version_is_malformed() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "3.0".to_string(),
                timestamp: Some(1_700_000_000),
                ..Default::default()
            },
            entity: vec![],
        };
        let result = FeedDecoder::default().decode_trip_updates(&feed.encode_to_vec());
        assert!(matches!(result, Err(FeedError::MalformedFeed { .. })));
    }

    #[test]
    fn oversized_payload_is_malformed() {
        let payload = feed_message(1_700_000_000, vec![]);
        let result = FeedDecoder::new(4).decode_vehicle_positions(&payload);
        assert!(matches!(result, Err(FeedError::MalformedFeed { .. })));
    }

    #[test]
    fn zero_entities_is_an_empty_cycle() {
        let payload = feed_message(1_700_000_000, vec![]);
        let decoded = FeedDecoder::default().decode_trip_updates(&payload).unwrap();
        assert!(decoded.records.is_empty());
        assert!(decoded.warnings.is_empty());
        assert_eq!(decoded.header_timestamp, Some(1_700_000_000));
    }

    #[test]
    fn bad_entity_is_skipped_with_warning() {
        let no_position = FeedEntity {
            id: "broken".to_string(),
            vehicle: Some(VehiclePosition {
                position: None,
                ..Default::default()
            }),
            ..Default::default()
        };
        let payload = feed_message(
            1_700_000_000,
            vec![
                no_position,
                vehicle_entity("e2", "v2", None, 53.55, -113.50, None),
            ],
        );

        let decoded = FeedDecoder::default().decode_vehicle_positions(&payload).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].entity_id, "broken");
    }

    #[test]
    fn vehicle_id_falls_back_to_entity_id() {
        let entity = FeedEntity {
            id: "entity-7".to_string(),
            vehicle: Some(VehiclePosition {
                position: Some(Position {
                    latitude: 53.5,
                    longitude: -113.5,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let payload = feed_message(1_700_000_000, vec![entity]);
        let decoded = FeedDecoder::default().decode_vehicle_positions(&payload).unwrap();
        assert_eq!(decoded.records[0].vehicle_id, "entity-7");
    }

    #[test]
    fn decodes_trip_updates_with_stop_time_updates() {
        let payload = feed_message(
            1_700_000_000,
            vec![trip_update_entity(
                "tu1",
                "t1",
                Some("r8"),
                vec![
                    stop_time_update(Some(1), Some("s1"), Some(1_700_000_100), None),
                    stop_time_update(Some(2), Some("s2"), None, Some(1_700_000_200)),
                    stop_time_update(None, None, Some(1_700_000_300), None),
                ],
            )],
        );

        let decoded = FeedDecoder::default().decode_trip_updates(&payload).unwrap();
        assert_eq!(decoded.records.len(), 1);
        let record = &decoded.records[0];
        assert_eq!(record.trip_id, "t1");
        assert_eq!(record.route_id.as_deref(), Some("r8"));
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.stop_time_updates.len(), 2);
        assert_eq!(record.stop_time_updates[0].predicted_arrival, Some(1_700_000_100));
        assert_eq!(record.stop_time_updates[1].predicted_departure, Some(1_700_000_200));
        // the anonymous stop time update is reported, not fatal
        assert_eq!(decoded.warnings.len(), 1);
    }

    #[test]
    fn trip_update_without_trip_id_is_skipped() {
        let payload = feed_message(
            1_700_000_000,
            vec![
                trip_update_entity("tu1", "", None, vec![]),
                trip_update_entity("tu2", "t2", None, vec![]),
            ],
        );
        let decoded = FeedDecoder::default().decode_trip_updates(&payload).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.records[0].trip_id, "t2");
        assert_eq!(decoded.warnings[0].entity_id, "tu1");
    }

    #[test]
    fn each_call_handles_one_kind() {
        let payload = feed_message(
            1_700_000_000,
            vec![
                vehicle_entity("e1", "v1", Some("t1"), 53.54, -113.49, None),
                trip_update_entity("tu1", "t1", None, vec![]),
            ],
        );
        let decoder = FeedDecoder::default();
        assert_eq!(decoder.decode_vehicle_positions(&payload).unwrap().records.len(), 1);
        assert_eq!(decoder.decode_trip_updates(&payload).unwrap().records.len(), 1);
    }
}
