//! Output paths for pipeline results.
//!
//! [`OutputRoute`] is the trigger's own publish path, attached once the
//! trigger is connected. [`BackgroundPublisher`] is a bounded side channel
//! for publishing envelopes outside the trigger's own flow.

use crate::envelope::{self, Envelope, EnvelopeBuilder};
use crate::function::BoxError;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Background publisher capacity must be greater than zero")]
    InvalidCapacity,
    #[error("Background publisher consumer closed, dropping message {correlation_id}")]
    Closed { correlation_id: String },
    #[error(transparent)]
    Envelope(#[from] envelope::Error),
}

/// Destination for pipeline output, implemented by each trigger over its transport.
#[async_trait::async_trait]
pub trait OutputSink: Send + Sync {
    async fn publish(
        &self,
        payload: Vec<u8>,
        correlation_id: &str,
        content_type: &str,
    ) -> Result<(), BoxError>;
}

/// Shared slot for the trigger's output sink.
///
/// Handed to the message handler and to every batch continuation when the
/// pipeline is built. The trigger attaches its sink during initialization,
/// when a publish topic is configured, and detaches it on teardown.
#[derive(Clone, Default)]
pub struct OutputRoute {
    sink: Arc<RwLock<Option<Arc<dyn OutputSink>>>>,
}

impl std::fmt::Debug for OutputRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRoute")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl OutputRoute {
    pub fn new() -> OutputRoute {
        OutputRoute::default()
    }

    pub fn attach(&self, sink: Arc<dyn OutputSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn detach(&self) {
        self.sink.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_attached(&self) -> bool {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Publishes through the attached sink.
    ///
    /// Returns `false` when no sink is attached. A failed publish is logged
    /// and still counts as routed, callers carry on either way.
    pub async fn publish(&self, payload: Vec<u8>, correlation_id: &str, content_type: &str) -> bool {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sink) = sink else {
            return false;
        };
        match sink.publish(payload, correlation_id, content_type).await {
            Ok(()) => debug!(correlation_id = %correlation_id, "Published pipeline output"),
            Err(err) => error!(correlation_id = %correlation_id, "Failed to publish pipeline output: {}", err),
        }
        true
    }
}

/// Producer half. Cloned freely, every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct BackgroundPublisher {
    tx: mpsc::Sender<Envelope>,
}

/// Consumer half, owned by the single task that drains the queue.
#[derive(Debug)]
pub struct BackgroundReceiver {
    rx: mpsc::Receiver<Envelope>,
}

/// Creates a publisher and its receiver over a queue holding at most `capacity` envelopes.
pub fn background_publisher(
    capacity: usize,
) -> Result<(BackgroundPublisher, BackgroundReceiver), Error> {
    if capacity == 0 {
        return Err(Error::InvalidCapacity);
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((BackgroundPublisher { tx }, BackgroundReceiver { rx }))
}

impl BackgroundPublisher {
    /// Enqueues an envelope, waiting for free capacity when the queue is full.
    pub async fn publish(
        &self,
        payload: Vec<u8>,
        correlation_id: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Result<(), Error> {
        let envelope = EnvelopeBuilder::new()
            .payload(payload)
            .correlation_id(correlation_id)
            .content_type(content_type)
            .build()?;
        let correlation_id = envelope.correlation_id().to_string();
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::Closed {
                correlation_id: correlation_id.clone(),
            })?;
        trace!(correlation_id = %correlation_id, "Queued background envelope");
        Ok(())
    }

    /// Whether the consumer has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl BackgroundReceiver {
    /// Receives the next envelope, or `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Closes the queue. Queued envelopes can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
