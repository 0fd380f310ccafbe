//! Message-bus trigger: subscribes to a NATS subject, runs every message through the
//! pipeline and drains the background publisher.

use crate::client::{self, ClientBuilder};
use edgeflow_core::{
    client::Client as _,
    config::parse_positive_duration,
    envelope::{self, Envelope, EnvelopeBuilder},
    function::BoxError,
    publisher::{BackgroundReceiver, OutputSink},
    trigger::{Deferred, MessageHandler, StateTracker, TriggerState},
};
use async_nats::HeaderMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn, Instrument};

/// Header carrying the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Errors that can occur while running the message-bus trigger.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("missing SubscribeTopic for MessageBus Trigger")]
    MissingSubscribeTopic,
    #[error("missing PublishTopic for MessageBus Trigger, required for background publishing")]
    MissingPublishTopic,
    #[error(transparent)]
    Client(#[from] client::Error),
    #[error(transparent)]
    Config(#[from] edgeflow_core::config::Error),
    #[error(transparent)]
    Subscribe(#[from] async_nats::SubscribeError),
    #[error(transparent)]
    Envelope(#[from] envelope::Error),
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Builds an envelope, taking content type and correlation id from the headers when set.
fn to_envelope(payload: Vec<u8>, headers: Option<&HeaderMap>) -> Result<Envelope, Error> {
    let header = |name: &str| {
        headers
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str().to_string())
            .filter(|value| !value.is_empty())
    };

    let mut builder = EnvelopeBuilder::new();
    if let Some(content_type) = header(CONTENT_TYPE_HEADER) {
        builder = builder.content_type(content_type);
    }
    if let Some(correlation_id) = header(CORRELATION_ID_HEADER) {
        builder = builder.correlation_id(correlation_id);
    }
    Ok(builder.payload(payload).build()?)
}

fn headers(correlation_id: &str, content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE_HEADER, content_type);
    headers.insert(CORRELATION_ID_HEADER, correlation_id);
    headers
}

/// Publishes pipeline output to a subject, with content type and correlation id headers.
#[derive(Debug, Clone)]
struct SubjectSink {
    client: async_nats::Client,
    subject: String,
}

#[async_trait::async_trait]
impl OutputSink for SubjectSink {
    async fn publish(
        &self,
        payload: Vec<u8>,
        correlation_id: &str,
        content_type: &str,
    ) -> Result<(), BoxError> {
        self.client
            .publish_with_headers(
                self.subject.clone(),
                headers(correlation_id, content_type),
                payload.into(),
            )
            .await?;
        Ok(())
    }
}

/// State shared by the subscription loop and per-message tasks.
#[derive(Debug)]
struct Dispatcher {
    handler: MessageHandler,
}

impl Dispatcher {
    async fn handle(&self, message: async_nats::Message) {
        let envelope = match to_envelope(message.payload.to_vec(), message.headers.as_ref()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("{}", err);
                return;
            }
        };
        debug!(
            correlation_id = %envelope.correlation_id(),
            subject = %message.subject,
            content_type = %envelope.content_type(),
            "Received message-bus message"
        );
        self.handler.dispatch(envelope).await;
    }
}

/// Consumes the background queue until every producer is gone.
async fn drain(sink: SubjectSink, mut receiver: BackgroundReceiver) {
    while let Some(envelope) = receiver.recv().await {
        let correlation_id = envelope.correlation_id().to_string();
        let content_type = envelope.content_type().to_string();
        let payload = envelope.into_payload();
        let size = payload.len();
        match sink.publish(payload, &correlation_id, &content_type).await {
            Ok(()) => debug!(correlation_id = %correlation_id, subject = %sink.subject, size, "Published background envelope"),
            Err(err) => error!(
                correlation_id = %correlation_id,
                subject = %sink.subject,
                "Failed to publish background envelope: {}",
                err
            ),
        }
    }
    debug!("Background publisher closed");
}

/// Message-bus trigger.
#[derive(Debug)]
pub struct Trigger {
    config: Arc<crate::config::Trigger>,
    handler: MessageHandler,
    state: StateTracker,
}

impl Trigger {
    fn publish_topic(&self) -> Option<String> {
        self.config
            .publish_topic
            .clone()
            .filter(|topic| !topic.is_empty())
    }

    async fn connect(&self) -> Result<async_nats::Client, Error> {
        let timeout = parse_positive_duration(
            self.config
                .connect_timeout
                .as_deref()
                .unwrap_or(crate::config::DEFAULT_CONNECT_TIMEOUT),
        )?;
        let client = ClientBuilder::new()
            .url(self.config.url.clone())
            .credentials_path(self.config.credentials_path.clone())
            .connect_timeout(timeout)
            .build()?;
        let connected = tokio::time::timeout(timeout, client.connect())
            .await
            .map_err(|_| Error::ConnectTimeout(self.config.url.clone()))??;
        connected
            .nats_client
            .ok_or_else(|| Error::MissingRequiredAttribute("nats_client".to_string()))
    }
}

#[async_trait::async_trait]
impl edgeflow_core::trigger::Trigger for Trigger {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(subject = %self.config.subscribe_topic, url = %self.config.url))]
    async fn initialize(
        &mut self,
        background: Option<BackgroundReceiver>,
    ) -> Result<Deferred, Error> {
        if self.config.subscribe_topic.is_empty() {
            return Err(Error::MissingSubscribeTopic);
        }
        let publish_topic = self.publish_topic();
        if background.is_some() && publish_topic.is_none() {
            return Err(Error::MissingPublishTopic);
        }
        info!("Initializing message-bus trigger");

        self.state.set(TriggerState::Connecting);
        let client = match self.connect().await {
            Ok(client) => client,
            Err(err) => {
                self.state.set(TriggerState::Stopped);
                return Err(err);
            }
        };
        self.state.set(TriggerState::Connected);

        let mut subscriber = match client.subscribe(self.config.subscribe_topic.clone()).await {
            Ok(subscriber) => subscriber,
            Err(err) => {
                self.state.set(TriggerState::Stopped);
                return Err(err.into());
            }
        };
        self.state.set(TriggerState::Subscribed);
        info!("Subscribed to message-bus subject");

        let output = self.handler.output_route().clone();
        let sink = publish_topic.map(|subject| SubjectSink {
            client: client.clone(),
            subject,
        });
        if let Some(sink) = &sink {
            output.attach(Arc::new(sink.clone()));
        }

        let dispatcher = Arc::new(Dispatcher {
            handler: self.handler.clone(),
        });
        let subscription = tokio::spawn(
            async move {
                while let Some(message) = subscriber.next().await {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(
                        async move { dispatcher.handle(message).await }
                            .instrument(tracing::Span::current()),
                    );
                }
                debug!("Message-bus subscription ended");
            }
            .instrument(tracing::Span::current()),
        );

        let drainer = match (background, sink) {
            (Some(receiver), Some(sink)) => Some(tokio::spawn(
                drain(sink, receiver).instrument(tracing::Span::current()),
            )),
            _ => None,
        };
        self.state.set(TriggerState::Running);

        let state = self.state.clone();
        Ok(Deferred::new(move || async move {
            info!("Disconnecting message-bus trigger");
            state.set(TriggerState::ShuttingDown);
            output.detach();
            subscription.abort();
            if let Some(drainer) = drainer {
                drainer.abort();
            }
            if let Err(err) = client.flush().await {
                warn!("Failed to flush message-bus client: {}", err);
            }
            drop(client);
            state.set(TriggerState::Stopped);
        }))
    }

    fn state(&self) -> watch::Receiver<TriggerState> {
        self.state.subscribe()
    }
}

/// Builder for the message-bus trigger.
#[derive(Default)]
pub struct TriggerBuilder {
    config: Option<Arc<crate::config::Trigger>>,
    handler: Option<MessageHandler>,
}

impl TriggerBuilder {
    pub fn new() -> TriggerBuilder {
        TriggerBuilder {
            ..Default::default()
        }
    }

    pub fn config(mut self, config: Arc<crate::config::Trigger>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn handler(mut self, handler: MessageHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Trigger, Error> {
        Ok(Trigger {
            config: self
                .config
                .ok_or_else(|| Error::MissingRequiredAttribute("config".to_string()))?,
            handler: self
                .handler
                .ok_or_else(|| Error::MissingRequiredAttribute("handler".to_string()))?,
            state: StateTracker::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_core::context::Context;
    use edgeflow_core::function::{BoxError, Flow, PipelineFunction};
    use edgeflow_core::publisher::background_publisher;
    use edgeflow_core::runtime::RuntimeBuilder;
    use edgeflow_core::trigger::Trigger as _;
    use edgeflow_core::value::Value;

    struct Pass;

    #[async_trait::async_trait]
    impl PipelineFunction for Pass {
        fn name(&self) -> &str {
            "pass"
        }

        async fn process(&self, _ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
            Ok(Flow::Continue(input.ok_or("No Data Received")?))
        }
    }

    fn handler() -> MessageHandler {
        let runtime = RuntimeBuilder::new().function(Arc::new(Pass)).build().unwrap();
        MessageHandler::new(Arc::new(runtime), None)
    }

    fn trigger(subscribe_topic: &str, publish_topic: Option<&str>) -> Trigger {
        TriggerBuilder::new()
            .config(Arc::new(crate::config::Trigger {
                url: "nats://127.0.0.1:1".to_string(),
                subscribe_topic: subscribe_topic.to_string(),
                publish_topic: publish_topic.map(str::to_string),
                connect_timeout: Some("2s".to_string()),
                ..Default::default()
            }))
            .handler(handler())
            .build()
            .unwrap()
    }

    #[test]
    fn test_envelope_from_headers() {
        let headers = headers("c-42", "text/plain");
        let envelope = to_envelope(b"{\"a\":1}".to_vec(), Some(&headers)).unwrap();
        assert_eq!(envelope.correlation_id(), "c-42");
        assert_eq!(envelope.content_type(), "text/plain");
    }

    #[test]
    fn test_envelope_without_headers() {
        let json = to_envelope(b"{\"a\":1}".to_vec(), None).unwrap();
        assert_eq!(json.content_type(), envelope::CONTENT_TYPE_JSON);
        assert!(!json.correlation_id().is_empty());

        let cbor = to_envelope(vec![0xa1, 0x01], Some(&HeaderMap::new())).unwrap();
        assert_eq!(cbor.content_type(), envelope::CONTENT_TYPE_CBOR);
        assert_ne!(json.correlation_id(), cbor.correlation_id());
    }

    #[tokio::test]
    async fn test_missing_subscribe_topic() {
        let mut trigger = trigger("", None);
        let err = trigger.initialize(None).await.unwrap_err();
        assert!(matches!(err, Error::MissingSubscribeTopic));
        assert_eq!(*trigger.state().borrow(), TriggerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_background_requires_publish_topic() {
        let (_publisher, receiver) = background_publisher(1).unwrap();
        let err = trigger("events", Some(""))
            .initialize(Some(receiver))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingPublishTopic));
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let mut trigger = trigger("events", Some("out"));
        let state = trigger.state();
        let err = trigger.initialize(None).await.unwrap_err();
        assert!(matches!(err, Error::Client(_) | Error::ConnectTimeout(_)));
        assert_eq!(*state.borrow(), TriggerState::Stopped);
        assert!(!trigger.handler.output_route().is_attached());
    }

    #[test]
    fn test_publish_topic_ignores_empty_subject() {
        assert_eq!(trigger("events", Some("out")).publish_topic().as_deref(), Some("out"));
        assert!(trigger("events", Some("")).publish_topic().is_none());
        assert!(trigger("events", None).publish_topic().is_none());
    }

    #[tokio::test]
    async fn test_invalid_connect_timeout() {
        let mut trigger = TriggerBuilder::new()
            .config(Arc::new(crate::config::Trigger {
                subscribe_topic: "events".to_string(),
                connect_timeout: Some("soon".to_string()),
                ..Default::default()
            }))
            .handler(handler())
            .build()
            .unwrap();
        let err = trigger.initialize(None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_requires_config() {
        let result = TriggerBuilder::new().handler(handler()).build();
        assert!(matches!(
            result,
            Err(Error::MissingRequiredAttribute(attr)) if attr == "config"
        ));
    }
}
