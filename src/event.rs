use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// A single field value from the event stream. The engine types its columns;
/// everything is carried through to JSON without coercion, with binary
/// payloads rendered as base64 text.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    /// Unsigned counters too large for `Integer`.
    Unsigned(u64),
    Float(f64),
    Boolean(bool),
    Binary(Vec<u8>),
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(value) => serializer.serialize_str(value),
            FieldValue::Integer(value) => serializer.serialize_i64(*value),
            FieldValue::Unsigned(value) => serializer.serialize_u64(*value),
            FieldValue::Float(value) => serializer.serialize_f64(*value),
            FieldValue::Boolean(value) => serializer.serialize_bool(*value),
            FieldValue::Binary(value) => serializer.serialize_str(&STANDARD.encode(value)),
        }
    }
}

/// One decoded unit from the live stream. Exists only long enough to be
/// converted and appended; never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub uuid: Uuid,
    /// The engine's own timestamp text, carried verbatim.
    pub timestamp: String,
    pub name: String,
    pub fields: BTreeMap<String, FieldValue>,
}

/// The persisted form of one event. Key names match what the downstream
/// tooling reads out of the JSONL files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Fields")]
    pub fields: BTreeMap<String, FieldValue>,
}

impl From<StreamEvent> for OutputRecord {
    fn from(event: StreamEvent) -> Self {
        OutputRecord {
            uuid: event.uuid,
            timestamp: event.timestamp,
            name: event.name,
            fields: event.fields,
        }
    }
}
