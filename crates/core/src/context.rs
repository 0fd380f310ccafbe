//! Per-invocation pipeline context and the resources shared by all invocations.

use crate::envelope::Envelope;
use crate::secret::SecretProvider;
use std::sync::Arc;

/// Read-only resources shared by every invocation of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Pipeline name used in log fields.
    pub name: String,
    /// Secret store consulted by senders before each send.
    pub secrets: Option<Arc<dyn SecretProvider>>,
}

#[derive(Default, Debug)]
pub struct ResourcesBuilder {
    name: Option<String>,
    secrets: Option<Arc<dyn SecretProvider>>,
}

impl ResourcesBuilder {
    pub fn new() -> ResourcesBuilder {
        ResourcesBuilder {
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn build(self) -> Arc<Resources> {
        Arc::new(Resources {
            name: self.name.unwrap_or_default(),
            secrets: self.secrets,
        })
    }
}

/// Payload marked for deferred retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryData {
    pub payload: Vec<u8>,
    /// Content type in effect when the send failed.
    pub content_type: String,
}

/// Mutable state threaded through one pipeline invocation.
#[derive(Debug)]
pub struct Context {
    correlation_id: String,
    content_type: String,
    output_data: Option<Vec<u8>>,
    retry_data: Option<RetryData>,
    resources: Arc<Resources>,
}

impl Context {
    pub fn new(
        correlation_id: impl Into<String>,
        content_type: impl Into<String>,
        resources: Arc<Resources>,
    ) -> Self {
        Context {
            correlation_id: correlation_id.into(),
            content_type: content_type.into(),
            output_data: None,
            retry_data: None,
            resources,
        }
    }

    pub fn from_envelope(envelope: &Envelope, resources: Arc<Resources>) -> Self {
        Context::new(envelope.correlation_id(), envelope.content_type(), resources)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn output_data(&self) -> Option<&[u8]> {
        self.output_data.as_deref()
    }

    pub fn set_output_data(&mut self, data: Vec<u8>) {
        self.output_data = Some(data);
    }

    pub fn take_output_data(&mut self) -> Option<Vec<u8>> {
        self.output_data.take()
    }

    pub fn retry_data(&self) -> Option<&RetryData> {
        self.retry_data.as_ref()
    }

    /// Marks `payload` for retry. The first payload marked in an invocation wins.
    pub fn set_retry_data(&mut self, payload: Vec<u8>) {
        if self.retry_data.is_none() {
            self.retry_data = Some(RetryData {
                payload,
                content_type: self.content_type.clone(),
            });
        }
    }

    /// Moves the retry data out once the chain has finished.
    pub fn take_retry_data(&mut self) -> Option<RetryData> {
        self.retry_data.take()
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    pub fn secrets(&self) -> Option<&Arc<dyn SecretProvider>> {
        self.resources.secrets.as_ref()
    }
}
