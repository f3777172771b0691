//! Server-initiated commands delivered to the device
//!
//! The service asks the device to write or remove records with a message of
//! the form `{"op": "PUSH" | "DEL", "data": ...}`. Push notification payloads
//! only carry strings, so `data` is usually JSON encoded inside a string; an
//! inline JSON value is accepted as well.

use crate::models::RecordType;
use serde::Deserialize;
use serde_json::Value;

/// Errors from decoding a command message
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unsupported command op: {0}")]
    UnknownOp(String),

    #[error("malformed command payload: {0}")]
    Malformed(String),
}

/// A decoded command
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    /// Write records into the device store; each carries its `recordType`
    Push { records: Vec<Value> },
    /// Remove records of one type by id
    Delete {
        record_type: RecordType,
        uuids: Vec<String>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    op: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    record_type: String,
    #[serde(alias = "uuid")]
    uuids: OneOrMany,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl RemoteCommand {
    pub fn parse(message: &Value) -> Result<Self, CommandError> {
        let envelope: Envelope = serde_json::from_value(message.clone())
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        let data = match envelope.data {
            Value::String(encoded) => serde_json::from_str(&encoded)
                .map_err(|e| CommandError::Malformed(e.to_string()))?,
            inline => inline,
        };

        match envelope.op.to_ascii_uppercase().as_str() {
            "PUSH" => {
                let records = match data {
                    Value::Array(records) => records,
                    record @ Value::Object(_) => vec![record],
                    other => {
                        return Err(CommandError::Malformed(format!(
                            "PUSH data must be a record or a list, got {}",
                            other
                        )))
                    }
                };
                Ok(Self::Push { records })
            }
            "DEL" => {
                let body: DeleteBody = serde_json::from_value(data)
                    .map_err(|e| CommandError::Malformed(e.to_string()))?;
                let record_type = RecordType::parse(&body.record_type)
                    .map_err(|e| CommandError::Malformed(e.to_string()))?;
                let uuids = match body.uuids {
                    OneOrMany::One(uuid) => vec![uuid],
                    OneOrMany::Many(uuids) => uuids,
                };
                Ok(Self::Delete { record_type, uuids })
            }
            other => Err(CommandError::UnknownOp(other.to_string())),
        }
    }
}

/// Result of applying a command to the data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Ids of the inserted records
    Inserted(Vec<String>),
    Deleted { record_type: String, count: usize },
}
