//! MQTT trigger: subscribes to a topic and runs every message through the pipeline.

use crate::client::{self, SecureMqttFactory, SecureMqttFactoryBuilder};
use edgeflow_core::{
    envelope::{self, EnvelopeBuilder},
    function::BoxError,
    publisher::{BackgroundReceiver, OutputSink},
    secret::SecretProvider,
    trigger::{Deferred, MessageHandler, StateTracker, TriggerState},
};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Delay before polling again after a connection error with auto-reconnect.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Errors that can occur while running the MQTT trigger.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("background publishing not supported for services using MQTT trigger")]
    BackgroundNotSupported,
    #[error("missing SubscribeTopic for MQTT Trigger. Must be present in [Trigger.ExternalMqtt] section.")]
    MissingSubscribeTopic,
    #[error(transparent)]
    Client(#[from] client::Error),
    #[error("Subscribing to topic {topic} failed with error: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("Broker rejected subscription to topic {0}")]
    SubscribeRejected(String),
    #[error("Timed out subscribing to topic {0}")]
    SubscribeTimeout(String),
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Publishes pipeline output to the configured publish topic.
#[derive(Debug)]
struct TopicSink {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    retain: bool,
}

#[async_trait::async_trait]
impl OutputSink for TopicSink {
    async fn publish(
        &self,
        payload: Vec<u8>,
        correlation_id: &str,
        _content_type: &str,
    ) -> Result<(), BoxError> {
        self.client
            .publish(self.topic.as_str(), self.qos, self.retain, payload)
            .await?;
        debug!(correlation_id = %correlation_id, topic = %self.topic, "Queued MQTT publish");
        Ok(())
    }
}

/// Sink for the publish topic, `None` when the trigger has nowhere to publish.
fn topic_sink(client: &AsyncClient, config: &crate::config::Trigger, qos: QoS) -> Option<TopicSink> {
    let topic = config.publish_topic.as_deref().filter(|topic| !topic.is_empty())?;
    Some(TopicSink {
        client: client.clone(),
        topic: topic.to_string(),
        qos,
        retain: config.broker.retain,
    })
}

/// State shared by the event loop task and per-message tasks.
#[derive(Debug)]
struct Dispatcher {
    client: AsyncClient,
    handler: MessageHandler,
    config: Arc<crate::config::Trigger>,
    qos: QoS,
}

impl Dispatcher {
    /// Runs one inbound publish through the pipeline.
    async fn handle(&self, publish: Publish) {
        let payload = publish.payload.to_vec();
        let envelope = match EnvelopeBuilder::new()
            .content_type(envelope::classify_content_type(&payload))
            .payload(payload)
            .build()
        {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("{}", err);
                return;
            }
        };
        debug!(
            correlation_id = %envelope.correlation_id(),
            topic = %publish.topic,
            content_type = %envelope.content_type(),
            "Received MQTT message"
        );
        self.handler.dispatch(envelope).await;
    }
}

/// MQTT trigger.
#[derive(Debug)]
pub struct Trigger {
    config: Arc<crate::config::Trigger>,
    factory: SecureMqttFactory,
    handler: MessageHandler,
    state: StateTracker,
}

#[async_trait::async_trait]
impl edgeflow_core::trigger::Trigger for Trigger {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(topic = %self.config.subscribe_topic, broker = %self.config.broker.url))]
    async fn initialize(
        &mut self,
        background: Option<BackgroundReceiver>,
    ) -> Result<Deferred, Error> {
        if background.is_some() {
            return Err(Error::BackgroundNotSupported);
        }
        if self.config.subscribe_topic.is_empty() {
            return Err(Error::MissingSubscribeTopic);
        }
        info!("Initializing MQTT trigger");

        let qos = client::qos(self.config.broker.qos)?;
        let timeout = client::connect_timeout(&self.config.broker)?;

        self.state.set(TriggerState::Connecting);
        let (client, mut eventloop) = match self.factory.connect().await {
            Ok(connected) => connected,
            Err(err) => {
                self.state.set(TriggerState::Stopped);
                return Err(err.into());
            }
        };
        self.state.set(TriggerState::Connected);

        let output = self.handler.output_route().clone();
        if let Some(sink) = topic_sink(&client, &self.config, qos) {
            output.attach(Arc::new(sink));
        }

        let dispatcher = Arc::new(Dispatcher {
            client: client.clone(),
            handler: self.handler.clone(),
            config: Arc::clone(&self.config),
            qos,
        });

        let topic = self.config.subscribe_topic.clone();
        if let Err(err) = subscribe(&client, &mut eventloop, &dispatcher, &topic, qos, timeout).await {
            output.detach();
            self.state.set(TriggerState::Stopped);
            return Err(err);
        }
        self.state.set(TriggerState::Subscribed);
        info!("Subscribed to MQTT topic");

        let event_loop = tokio::spawn(
            run_event_loop(eventloop, Arc::clone(&dispatcher), self.state.clone())
                .instrument(tracing::Span::current()),
        );
        self.state.set(TriggerState::Running);

        let state = self.state.clone();
        Ok(Deferred::new(move || async move {
            info!("Disconnecting MQTT trigger");
            state.set(TriggerState::ShuttingDown);
            output.detach();
            if let Err(err) = client.disconnect().await {
                warn!("Failed to send MQTT disconnect: {}", err);
            }
            event_loop.abort();
            state.set(TriggerState::Stopped);
        }))
    }

    fn state(&self) -> watch::Receiver<TriggerState> {
        self.state.subscribe()
    }
}

/// Subscribes and waits for the broker's acknowledgement.
///
/// Messages arriving before the acknowledgement are dispatched normally.
async fn subscribe(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    dispatcher: &Arc<Dispatcher>,
    topic: &str,
    qos: QoS,
    timeout: Duration,
) -> Result<(), Error> {
    client
        .subscribe(topic, qos)
        .await
        .map_err(|source| Error::Subscribe {
            topic: topic.to_string(),
            source,
        })?;

    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    return if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        Err(Error::SubscribeRejected(topic.to_string()))
                    } else {
                        Ok(())
                    };
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => dispatch(dispatcher, publish),
                Ok(_) => {}
                Err(source) => return Err(client::Error::Connection { source }.into()),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::SubscribeTimeout(topic.to_string()))?
}

fn dispatch(dispatcher: &Arc<Dispatcher>, publish: Publish) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move { dispatcher.handle(publish).await }.instrument(tracing::Span::current()));
}

/// Polls the event loop for the lifetime of the trigger.
async fn run_event_loop(mut eventloop: EventLoop, dispatcher: Arc<Dispatcher>, state: StateTracker) {
    let topic = dispatcher.config.subscribe_topic.clone();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => dispatch(&dispatcher, publish),
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker, resubscribing");
                if let Err(err) = dispatcher.client.try_subscribe(topic.as_str(), dispatcher.qos) {
                    error!("Failed to resubscribe to {}: {}", topic, err);
                }
            }
            Ok(_) => {}
            Err(err) => {
                if matches!(
                    state.get(),
                    TriggerState::ShuttingDown | TriggerState::Stopped
                ) {
                    break;
                }
                if !dispatcher.config.broker.auto_reconnect {
                    error!("MQTT connection lost: {}", err);
                    state.set(TriggerState::Stopped);
                    break;
                }
                warn!("MQTT connection error, reconnecting: {}", err);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Builder for the MQTT trigger.
#[derive(Default)]
pub struct TriggerBuilder {
    config: Option<Arc<crate::config::Trigger>>,
    handler: Option<MessageHandler>,
    secrets: Option<Arc<dyn SecretProvider>>,
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

    pub fn secrets(mut self, secrets: Option<Arc<dyn SecretProvider>>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn build(self) -> Result<Trigger, Error> {
        let config = self
            .config
            .ok_or_else(|| Error::MissingRequiredAttribute("config".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| Error::MissingRequiredAttribute("handler".to_string()))?;
        let factory = SecureMqttFactoryBuilder::new()
            .broker(Arc::new(config.broker.clone()))
            .secrets(self.secrets)
            .build()?;
        Ok(Trigger {
            config,
            factory,
            handler,
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

    fn config(subscribe_topic: &str) -> Arc<crate::config::Trigger> {
        Arc::new(crate::config::Trigger {
            broker: crate::config::Broker {
                url: "tcp://127.0.0.1:1".to_string(),
                client_id: "edgeflow-test".to_string(),
                connect_timeout: Some("5s".to_string()),
                ..Default::default()
            },
            subscribe_topic: subscribe_topic.to_string(),
            publish_topic: None,
        })
    }

    fn trigger(subscribe_topic: &str) -> Trigger {
        TriggerBuilder::new()
            .config(config(subscribe_topic))
            .handler(handler())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_background_receiver_is_rejected() {
        let (_publisher, receiver) = background_publisher(1).unwrap();
        let err = trigger("events").initialize(Some(receiver)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "background publishing not supported for services using MQTT trigger"
        );
    }

    #[tokio::test]
    async fn test_missing_subscribe_topic() {
        let mut trigger = trigger("");
        let err = trigger.initialize(None).await.unwrap_err();
        assert!(matches!(err, Error::MissingSubscribeTopic));
        assert_eq!(*trigger.state().borrow(), TriggerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let mut trigger = trigger("events");
        let state = trigger.state();
        let err = trigger.initialize(None).await.unwrap_err();
        assert!(matches!(err, Error::Client(_)));
        assert_eq!(*state.borrow(), TriggerState::Stopped);
        assert!(!trigger.handler.output_route().is_attached());
    }

    fn mqtt_client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(rumqttc::MqttOptions::new("edgeflow-test", "127.0.0.1", 1883), 4)
    }

    #[tokio::test]
    async fn test_topic_sink_requires_publish_topic() {
        let (client, _eventloop) = mqtt_client();
        let mut config = (*config("events")).clone();
        assert!(topic_sink(&client, &config, QoS::AtMostOnce).is_none());

        config.publish_topic = Some(String::new());
        assert!(topic_sink(&client, &config, QoS::AtMostOnce).is_none());

        config.publish_topic = Some("out".to_string());
        config.broker.retain = true;
        let sink = topic_sink(&client, &config, QoS::AtLeastOnce).unwrap();
        assert_eq!(sink.topic, "out");
        assert_eq!(sink.qos, QoS::AtLeastOnce);
        assert!(sink.retain);
    }

    #[tokio::test]
    async fn test_topic_sink_queues_publish() {
        let (client, eventloop) = mqtt_client();
        let mut config = (*config("events")).clone();
        config.publish_topic = Some("out".to_string());
        let sink = topic_sink(&client, &config, QoS::AtMostOnce).unwrap();

        sink.publish(b"data".to_vec(), "c1", "text/plain").await.unwrap();

        drop(eventloop);
        assert!(sink.publish(b"data".to_vec(), "c2", "text/plain").await.is_err());
    }

    #[test]
    fn test_builder_requires_handler() {
        let result = TriggerBuilder::new().config(config("events")).build();
        assert!(matches!(
            result,
            Err(Error::MissingRequiredAttribute(attr)) if attr == "handler"
        ));
    }

    #[test]
    fn test_builder_rejects_invalid_broker_url() {
        let mut config = (*config("events")).clone();
        config.broker.url = "http://localhost".to_string();
        let result = TriggerBuilder::new()
            .config(Arc::new(config))
            .handler(handler())
            .build();
        assert!(matches!(
            result,
            Err(Error::Client(client::Error::UnsupportedScheme(_)))
        ));
    }
}
