// ============================================================================
// Storage Sinks
// ============================================================================
//
// The pipeline only ever writes: one object per feed kind per cycle, and one
// item per reconciled stop. No read-modify-write.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::SinkError;
use crate::models::{DelayRecord, FeatureVector, FeedKind};

/// Object key for a cycle's batch: `transit/{kind}/{YYYYMMDD}/{YYYYMMDD_HHMMSS}.json`.
pub fn object_key(kind: FeedKind, captured_at: DateTime<Utc>) -> String {
    format!(
        "transit/{}/{}/{}.json",
        kind.as_str(),
        captured_at.format("%Y%m%d"),
        captured_at.format("%Y%m%d_%H%M%S")
    )
}

pub trait ObjectSink: Send + Sync {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), SinkError>;
}

/// Serialises `records` as a JSON document and stores it under the cycle's key.
pub fn put_batch<T: Serialize>(
    sink: &dyn ObjectSink,
    kind: FeedKind,
    captured_at: DateTime<Utc>,
    records: &[T],
) -> Result<String, SinkError> {
    #[derive(Serialize)]
    struct Batch<'a, T> {
        feed: FeedKind,
        captured_at: DateTime<Utc>,
        count: usize,
        records: &'a [T],
    }

    let key = object_key(kind, captured_at);
    let body = serde_json::to_vec(&Batch {
        feed: kind,
        captured_at,
        count: records.len(),
        records,
    })
    .map_err(|e| SinkError::Serialize(format!("{} batch: {}", kind, e)))?;
    sink.put_object(&key, &body)?;
    Ok(key)
}

pub struct LocalObjectSink {
    root: PathBuf,
}

impl LocalObjectSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectSink for LocalObjectSink {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), SinkError> {
        let path = self.root.join(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;
        }
        fs::write(&path, body).map_err(|e| write_error(&path, e))?;
        debug!(path = %path.display(), bytes = body.len(), "Stored object");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectSink {
    objects: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryObjectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.iter().map(|(key, _)| key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, body)| body.clone())
    }
}

impl ObjectSink for MemoryObjectSink {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), SinkError> {
        let mut objects = self.objects.lock().map_err(|e| SinkError::Write {
            path: key.to_string(),
            reason: e.to_string(),
        })?;
        objects.push((key.to_string(), body.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Record Sink
// ============================================================================

/// One stored row: a reconciled stop and its features.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordItem {
    pub pk: String,
    pub sk: String,
    pub delay: DelayRecord,
    pub features: FeatureVector,
}

impl RecordItem {
    pub fn new(delay: DelayRecord, features: FeatureVector) -> Self {
        let pk = format!("TRIP#{}", delay.route_id.as_deref().unwrap_or("unknown"));
        let sk = format!(
            "{}#{}#{}",
            delay.capture_epoch,
            delay.trip_id,
            delay.stop_id.as_deref().unwrap_or("")
        );
        Self { pk, sk, delay, features }
    }
}

pub trait RecordSink: Send + Sync {
    fn put_record(&self, item: &RecordItem) -> Result<(), SinkError>;
}

/// Appends one JSON document per line.
pub struct JsonLinesRecordSink {
    path: PathBuf,
    file: Mutex<Option<fs::File>>,
}

impl JsonLinesRecordSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<fs::File, SinkError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| write_error(&self.path, e))
    }
}

impl RecordSink for JsonLinesRecordSink {
    fn put_record(&self, item: &RecordItem) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(item).map_err(|e| SinkError::Serialize(format!("{}: {}", item.sk, e)))?;
        line.push(b'\n');

        let mut guard = self.file.lock().map_err(|e| write_error(&self.path, e))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        match guard.as_mut() {
            Some(file) => file.write_all(&line).map_err(|e| write_error(&self.path, e)),
            None => Err(write_error(&self.path, "file handle unavailable")),
        }
    }
}

#[derive(Default)]
pub struct MemoryRecordSink {
    items: Mutex<Vec<RecordItem>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<RecordItem> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemoryRecordSink {
    fn put_record(&self, item: &RecordItem) -> Result<(), SinkError> {
        let mut items = self.items.lock().map_err(|e| SinkError::Write {
            path: "memory".to_string(),
            reason: e.to_string(),
        })?;
        items.push(item.clone());
        Ok(())
    }
}

fn write_error(path: &Path, e: impl std::fmt::Display) -> SinkError {
    SinkError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
