//! External health data source
//!
//! The engine reads records from an on-device store through
//! [`HealthDataSource`]. [`FileDataSource`] implements it over a directory of
//! exported JSON files (`{dir}/{recordType}.json`, one array per type).

use crate::models::RecordType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors reported by a data source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("data source is not initialized")]
    NotInitialized,

    #[error("permission denied for {access:?} access to {record_type}")]
    PermissionDenied {
        record_type: String,
        access: AccessType,
    },

    #[error("record is missing a valid recordType: {0}")]
    InvalidRecord(String),

    #[error("data source I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("data source file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Half-open read window `[start_time, end_time)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_time && at < self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Read,
    Write,
}

/// Access to one record type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub access_type: AccessType,
    pub record_type: String,
}

impl Permission {
    pub fn read(record_type: &RecordType) -> Self {
        Self {
            access_type: AccessType::Read,
            record_type: record_type.to_string(),
        }
    }
}

/// On-device store of health records
#[async_trait]
pub trait HealthDataSource: Send + Sync {
    /// Prepare the source; `false` when it is unavailable on this device
    async fn initialize(&self) -> Result<bool, SourceError>;

    async fn read_records(
        &self,
        record_type: &RecordType,
        range: &TimeRange,
    ) -> Result<Vec<Value>, SourceError>;

    async fn read_record(
        &self,
        record_type: &RecordType,
        id: &str,
    ) -> Result<Option<Value>, SourceError>;

    /// Insert records carrying a `recordType` field, returning their ids
    async fn insert_records(&self, records: Vec<Value>) -> Result<Vec<String>, SourceError>;

    async fn delete_records_by_uuids(
        &self,
        record_type: &RecordType,
        uuids: &[String],
    ) -> Result<(), SourceError>;

    async fn granted_permissions(&self) -> Result<Vec<Permission>, SourceError>;

    /// Ask for permissions, returning those granted
    async fn request_permissions(
        &self,
        permissions: &[Permission],
    ) -> Result<Vec<Permission>, SourceError>;
}

/// Record id: `metadata.id` as exported by the device store, else `id`
pub fn record_id(record: &Value) -> Option<&str> {
    record
        .pointer("/metadata/id")
        .and_then(Value::as_str)
        .or_else(|| record.get("id").and_then(Value::as_str))
}

/// Instant used for window filtering: `time` for point records, `startTime` for intervals
pub fn record_time(record: &Value) -> Option<DateTime<Utc>> {
    ["time", "startTime"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(Value::as_str))
        .find_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Records exported as one JSON array file per record type
pub struct FileDataSource {
    dir: PathBuf,
    // Serializes read-modify-write of the type files
    write_lock: Mutex<()>,
}

impl FileDataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, record_type: &RecordType) -> PathBuf {
        self.dir.join(format!("{}.json", record_type))
    }

    async fn load(&self, record_type: &RecordType) -> Result<Vec<Value>, SourceError> {
        match tokio::fs::read(self.file_for(record_type)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, record_type: &RecordType, records: &[Value]) -> Result<(), SourceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.file_for(record_type);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl HealthDataSource for FileDataSource {
    async fn initialize(&self) -> Result<bool, SourceError> {
        let available = tokio::fs::metadata(&self.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        debug!(dir = %self.dir.display(), available, "File data source initialized");
        Ok(available)
    }

    async fn read_records(
        &self,
        record_type: &RecordType,
        range: &TimeRange,
    ) -> Result<Vec<Value>, SourceError> {
        let records = self.load(record_type).await?;
        Ok(records
            .into_iter()
            .filter(|r| record_time(r).is_some_and(|t| range.contains(t)))
            .collect())
    }

    async fn read_record(
        &self,
        record_type: &RecordType,
        id: &str,
    ) -> Result<Option<Value>, SourceError> {
        let records = self.load(record_type).await?;
        Ok(records.into_iter().find(|r| record_id(r) == Some(id)))
    }

    async fn insert_records(&self, records: Vec<Value>) -> Result<Vec<String>, SourceError> {
        let _guard = self.write_lock.lock().await;
        let mut ids = Vec::with_capacity(records.len());

        for mut record in records {
            let raw_type = record
                .get("recordType")
                .and_then(Value::as_str)
                .ok_or_else(|| SourceError::InvalidRecord(record.to_string()))?;
            let record_type = RecordType::parse(raw_type)
                .map_err(|e| SourceError::InvalidRecord(e.to_string()))?;

            let id = match record_id(&record) {
                Some(id) => id.to_string(),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    record["metadata"]["id"] = Value::String(id.clone());
                    id
                }
            };

            let mut existing = self.load(&record_type).await?;
            existing.push(record);
            self.store(&record_type, &existing).await?;
            ids.push(id);
        }

        Ok(ids)
    }

    async fn delete_records_by_uuids(
        &self,
        record_type: &RecordType,
        uuids: &[String],
    ) -> Result<(), SourceError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load(record_type).await?;
        let before = records.len();
        records.retain(|r| !record_id(r).is_some_and(|id| uuids.iter().any(|u| u == id)));
        if records.len() != before {
            self.store(record_type, &records).await?;
        }
        debug!(record_type = %record_type, removed = before - records.len(), "Deleted records");
        Ok(())
    }

    async fn granted_permissions(&self) -> Result<Vec<Permission>, SourceError> {
        Ok(RecordType::all_health()
            .iter()
            .flat_map(|rt| {
                [AccessType::Read, AccessType::Write].map(|access_type| Permission {
                    access_type,
                    record_type: rt.to_string(),
                })
            })
            .collect())
    }

    async fn request_permissions(
        &self,
        permissions: &[Permission],
    ) -> Result<Vec<Permission>, SourceError> {
        Ok(permissions.to_vec())
    }
}
