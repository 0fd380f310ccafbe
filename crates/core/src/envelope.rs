//! Immutable unit of inbound and outbound data.

/// Content type for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for CBOR (binary) payloads.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";
/// Content type for plain text payloads.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Content type for XML payloads.
pub const CONTENT_TYPE_XML: &str = "application/xml";

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Payload plus the metadata every pipeline stage can rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    correlation_id: String,
    content_type: String,
    payload: Vec<u8>,
}

impl Envelope {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Classifies a raw transport payload by its first byte.
///
/// Payloads starting with `{` are JSON, anything else (including an empty
/// payload) is treated as binary CBOR.
pub fn classify_content_type(payload: &[u8]) -> &'static str {
    match payload.first() {
        Some(b'{') => CONTENT_TYPE_JSON,
        _ => CONTENT_TYPE_CBOR,
    }
}

/// Generates a fresh correlation id for an inbound message.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Default, Debug)]
pub struct EnvelopeBuilder {
    correlation_id: Option<String>,
    content_type: Option<String>,
    payload: Option<Vec<u8>>,
}

impl EnvelopeBuilder {
    pub fn new() -> EnvelopeBuilder {
        EnvelopeBuilder {
            ..Default::default()
        }
    }

    /// Sets the correlation id. A fresh one is generated when omitted.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the content type. The payload is classified when omitted.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn build(self) -> Result<Envelope, Error> {
        let payload = self
            .payload
            .ok_or_else(|| Error::MissingRequiredAttribute("payload".to_string()))?;
        let content_type = self
            .content_type
            .unwrap_or_else(|| classify_content_type(&payload).to_string());
        Ok(Envelope {
            correlation_id: self.correlation_id.unwrap_or_else(new_correlation_id),
            content_type,
            payload,
        })
    }
}
