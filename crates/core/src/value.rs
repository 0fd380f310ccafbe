//! Values handed from one pipeline stage to the next.

use crate::event::Event;
use std::fmt::Debug;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("marshaling input data to JSON failed, passed in data must be of type []byte, string, or support marshaling to JSON")]
    Marshal {
        #[source]
        source: serde_json::Error,
    },
    #[error("No Data Received")]
    NoData,
}

/// A structured value that knows how to turn itself into JSON bytes.
pub trait Marshal: Debug + Send + Sync {
    fn marshal(&self) -> Result<Vec<u8>, serde_json::Error>;
}

impl<T> Marshal for T
where
    T: serde::Serialize + Debug + Send + Sync,
{
    fn marshal(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Inter-stage value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Raw bytes, passed through untouched.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// Parsed JSON document.
    Json(serde_json::Value),
    /// Decoded device event.
    Event(Event),
    /// Any other serializable value.
    Structured(Arc<dyn Marshal>),
}

impl Value {
    pub fn structured<T>(value: T) -> Self
    where
        T: serde::Serialize + Debug + Send + Sync + 'static,
    {
        Value::Structured(Arc::new(value))
    }

    /// Coerces the value into the bytes a sender puts on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            Value::Text(text) => Ok(text.as_bytes().to_vec()),
            Value::Json(json) => {
                serde_json::to_vec(json).map_err(|source| Error::Marshal { source })
            }
            Value::Event(event) => {
                serde_json::to_vec(event).map_err(|source| Error::Marshal { source })
            }
            Value::Structured(value) => value.marshal().map_err(|source| Error::Marshal { source }),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Text(text) => Ok(text.into_bytes()),
            other => other.to_bytes(),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        Value::Event(event)
    }
}

/// Fails with [`Error::NoData`] when a stage received nothing.
pub fn require(input: Option<Value>) -> Result<Value, Error> {
    input.ok_or(Error::NoData)
}
