//! Device event model consumed by the built-in transforms.

use crate::envelope::CONTENT_TYPE_CBOR;
use crate::value::{self, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// JSON serialization or deserialization error.
    #[error("JSON serialization/deserialization failed: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::error::Error,
    },
    #[error(transparent)]
    Value(#[from] value::Error),
    /// Binary event payloads cannot be decoded.
    #[error("Unsupported content type for event decoding: {0}")]
    UnsupportedContentType(String),
}

/// A device event with its readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    /// Name of the device that produced the event.
    pub device: String,
    /// Origin timestamp in nanoseconds.
    #[serde(default)]
    pub origin: i64,
    #[serde(default)]
    pub readings: Vec<Reading>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(default)]
    pub id: String,
    /// Resource name of the reading, for example `temperature`.
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl Event {
    /// Decodes an event from a stage input.
    ///
    /// Byte input is decoded according to the context content type.
    pub fn from_value(value: Value, content_type: &str) -> Result<Event, Error> {
        match value {
            Value::Event(event) => Ok(event),
            Value::Json(json) => {
                serde_json::from_value(json).map_err(|source| Error::SerdeJson { source })
            }
            Value::Text(text) => {
                serde_json::from_str(&text).map_err(|source| Error::SerdeJson { source })
            }
            Value::Bytes(_) if content_type == CONTENT_TYPE_CBOR => {
                Err(Error::UnsupportedContentType(content_type.to_string()))
            }
            other => {
                let bytes = other.into_bytes()?;
                serde_json::from_slice(&bytes).map_err(|source| Error::SerdeJson { source })
            }
        }
    }
}
