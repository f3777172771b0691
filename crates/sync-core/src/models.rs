//! Core data models for the sync engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Canonical health record types accepted by the collection service
pub const HEALTH_RECORD_TYPES: &[&str] = &[
    "activeCaloriesBurned",
    "basalBodyTemperature",
    "basalMetabolicRate",
    "bloodGlucose",
    "bloodPressure",
    "bodyFat",
    "bodyTemperature",
    "boneMass",
    "cervicalMucus",
    "distance",
    "exerciseSession",
    "elevationGained",
    "floorsClimbed",
    "heartRate",
    "height",
    "hydration",
    "leanBodyMass",
    "menstruationFlow",
    "menstruationPeriod",
    "nutrition",
    "ovulationTest",
    "oxygenSaturation",
    "power",
    "respiratoryRate",
    "restingHeartRate",
    "sleepSession",
    "speed",
    "steps",
    "stepsCadence",
    "totalCaloriesBurned",
    "vo2Max",
    "weight",
    "wheelchairPushes",
];

/// Device sensor streams, ingested as chunks rather than records
pub const SENSOR_TYPES: &[&str] = &["accelerometer", "gyroscope"];

/// A validated record type name in camelCase form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordType(String);

impl RecordType {
    /// Parse a record type, accepting both camelCase and PascalCase spellings
    pub fn parse(raw: &str) -> Result<Self, UnknownRecordType> {
        let trimmed = raw.trim();
        let mut chars = trimmed.chars();
        let normalized = match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect::<String>(),
            None => return Err(UnknownRecordType(raw.to_string())),
        };

        if HEALTH_RECORD_TYPES.contains(&normalized.as_str())
            || SENSOR_TYPES.contains(&normalized.as_str())
        {
            Ok(Self(normalized))
        } else {
            Err(UnknownRecordType(raw.to_string()))
        }
    }

    /// All health record types, in catalogue order
    pub fn all_health() -> Vec<RecordType> {
        HEALTH_RECORD_TYPES
            .iter()
            .map(|t| RecordType((*t).to_string()))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sensor streams are always sent to the ingest endpoint
    pub fn is_sensor(&self) -> bool {
        SENSOR_TYPES.contains(&self.0.as_str())
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordType {
    type Error = UnknownRecordType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecordType::parse(&value)
    }
}

impl From<RecordType> for String {
    fn from(value: RecordType) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown record type: '{0}'")]
pub struct UnknownRecordType(pub String);

/// Credentials issued by the collection service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry: None,
        }
    }
}

/// Token pair returned by `/login` and `/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub refresh: String,
    #[serde(default)]
    pub expiry: Option<String>,
}

impl From<TokenResponse> for Session {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.token,
            refresh_token: response.refresh,
            expiry: response.expiry,
        }
    }
}

/// Delivery priority of a queued payload
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// A payload waiting in the offline queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub record_type: String,
    pub payload: Value,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    /// Insertion sequence, breaks ties between items enqueued in the same instant
    #[serde(default)]
    pub seq: u64,
}

/// One raw three-axis sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_offset_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

/// A sealed batch of sensor samples with device metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub device_id: String,
    pub device_model: Option<String>,
    pub platform: String,
    pub sample_rate_hz: f64,
    pub started_at: DateTime<Utc>,
    pub samples: Vec<Sample>,
}

/// Phase of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Syncing,
    Completed,
}

/// Progress report emitted during a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub phase: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_type: Option<String>,
}

/// Result of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub total: usize,
    pub synced: usize,
    pub timestamp: DateTime<Utc>,
    /// Record types whose submission failed in this run
    pub failed_types: Vec<String>,
}

/// Notifications published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEvent {
    SyncCompleted { timestamp: DateTime<Utc>, total: usize },
    SyncError { error: String },
}

/// Acknowledgement returned by the ingest endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub matched: u64,
    #[serde(default)]
    pub modified: u64,
    #[serde(default)]
    pub upserts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_normalizes_pascal_case() {
        let rt = RecordType::parse("HeartRate").unwrap();
        assert_eq!(rt.as_str(), "heartRate");
        assert!(!rt.is_sensor());
    }

    #[test]
    fn test_record_type_rejects_unknown() {
        assert!(RecordType::parse("mood").is_err());
        assert!(RecordType::parse("").is_err());
    }

    #[test]
    fn test_sensor_types() {
        assert!(RecordType::parse("Accelerometer").unwrap().is_sensor());
        assert_eq!(RecordType::all_health().len(), HEALTH_RECORD_TYPES.len());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_sample_serializes_offset_in_camel_case() {
        let sample = Sample {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            t_offset_ms: Some(20),
            ts: None,
        };
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json["tOffsetMs"], 20);
        assert!(json.get("ts").is_none());
    }

    #[test]
    fn test_sync_event_tagging() {
        let event = SyncEvent::SyncError {
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["event"], "SYNC_ERROR");
    }
}
