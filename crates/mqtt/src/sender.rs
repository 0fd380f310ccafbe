//! MQTT sender that publishes the stage input to a topic.

use crate::client::{self, KeyCertPair, SecureMqttFactory, SecureMqttFactoryBuilder};
use edgeflow_core::{
    context::Context,
    function::{BoxError, Flow, PipelineFunction},
    secret::SecretProvider,
    value::{self, Value},
};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Errors that can occur while publishing over MQTT.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Client(#[from] client::Error),
    #[error("Publishing to topic {topic} failed with error: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error(transparent)]
    Value(#[from] value::Error),
    #[error("Not connected to broker {0}, publish not attempted")]
    NotConnected(String),
    #[error("Topic must not be empty")]
    EmptyTopic,
    #[error("Both cert_file and key_file must be set for a client certificate")]
    IncompleteKeyPair,
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Connected client plus the task driving its event loop.
#[derive(Debug)]
struct Connection {
    client: AsyncClient,
    driver: JoinHandle<()>,
    /// Cleared by the driver on a connection error, set again on reconnect.
    connected: Arc<AtomicBool>,
}

/// MQTT sender pipeline function.
///
/// Connects lazily on the first send and again after the event loop gives up.
/// Publishes fail immediately while the broker is unreachable.
#[derive(Debug)]
pub struct Sender {
    config: Arc<crate::config::Sender>,
    factory: SecureMqttFactory,
    qos: QoS,
    connection: Mutex<Option<Connection>>,
}

impl Sender {
    /// Returns a client for a live connection, connecting when there is none.
    async fn client(&self) -> Result<AsyncClient, Error> {
        let mut connection = self.connection.lock().await;
        if let Some(current) = connection.as_ref() {
            if current.driver.is_finished() {
                info!(broker = %self.config.broker.url, "MQTT sender connection closed, reconnecting");
                *connection = None;
            } else if !current.connected.load(Ordering::Acquire) {
                return Err(Error::NotConnected(self.config.broker.url.clone()));
            } else {
                return Ok(current.client.clone());
            }
        }

        let (client, eventloop) = self.factory.connect().await?;
        info!(broker = %self.config.broker.url, "Connected MQTT sender");
        let connected = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(drive(
            eventloop,
            self.config.broker.auto_reconnect,
            Arc::clone(&connected),
        ));
        *connection = Some(Connection {
            client: client.clone(),
            driver,
            connected,
        });
        Ok(client)
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        self.client()
            .await?
            .try_publish(
                self.config.topic.as_str(),
                self.qos,
                self.config.broker.retain,
                data,
            )
            .map_err(|source| Error::Publish {
                topic: self.config.topic.clone(),
                source,
            })
    }

    async fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let data = value::require(input)?.into_bytes()?;
        match self.send(data.clone()).await {
            Ok(()) => {
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    topic = %self.config.topic,
                    size = data.len(),
                    "Published to MQTT"
                );
                Ok(Flow::Pending)
            }
            Err(err) => {
                error!(
                    correlation_id = %ctx.correlation_id(),
                    topic = %self.config.topic,
                    persist = self.config.persist_on_error,
                    "{}",
                    err
                );
                if self.config.persist_on_error {
                    ctx.set_retry_data(data);
                }
                Err(err)
            }
        }
    }
}

/// Keeps the event loop polled so queued publishes reach the broker.
async fn drive(mut eventloop: EventLoop, auto_reconnect: bool, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !connected.swap(true, Ordering::AcqRel) {
                    info!("MQTT sender reconnected");
                }
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, Ordering::Release);
                if !auto_reconnect {
                    error!("MQTT sender connection lost: {}", err);
                    break;
                }
                warn!("MQTT sender connection error, reconnecting: {}", err);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Sender {
    fn name(&self) -> &str {
        "mqtt_send"
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).await.map_err(Into::into)
    }

    async fn shutdown(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(err) = connection.client.try_disconnect() {
                warn!("Failed to disconnect MQTT sender: {}", err);
            }
            connection.driver.abort();
        }
    }
}

/// Builder for the MQTT sender.
#[derive(Default)]
pub struct SenderBuilder {
    config: Option<Arc<crate::config::Sender>>,
    secrets: Option<Arc<dyn SecretProvider>>,
}

impl SenderBuilder {
    pub fn new() -> SenderBuilder {
        SenderBuilder {
            ..Default::default()
        }
    }

    pub fn config(mut self, config: Arc<crate::config::Sender>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn secrets(mut self, secrets: Option<Arc<dyn SecretProvider>>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Validates the configuration and reads the client certificate files, if any.
    pub async fn build(self) -> Result<Sender, Error> {
        let config = self
            .config
            .ok_or_else(|| Error::MissingRequiredAttribute("config".to_string()))?;
        if config.topic.is_empty() {
            return Err(Error::EmptyTopic);
        }
        let qos = client::qos(config.broker.qos)?;

        let mut factory = SecureMqttFactoryBuilder::new()
            .broker(Arc::new(config.broker.clone()))
            .secrets(self.secrets);
        match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                factory = factory.key_pair(KeyCertPair::from_files(cert_file, key_file).await?);
            }
            (None, None) => {}
            _ => return Err(Error::IncompleteKeyPair),
        }

        Ok(Sender {
            factory: factory.build()?,
            config,
            qos,
            connection: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_core::context::ResourcesBuilder;
    use std::collections::HashMap;

    fn config(persist_on_error: bool) -> crate::config::Sender {
        crate::config::Sender {
            broker: crate::config::Broker {
                url: "tcp://127.0.0.1:1".to_string(),
                client_id: "edgeflow-sender-test".to_string(),
                connect_timeout: Some("5s".to_string()),
                ..Default::default()
            },
            topic: "out".to_string(),
            persist_on_error,
            ..Default::default()
        }
    }

    async fn sender(config: crate::config::Sender) -> Sender {
        SenderBuilder::new()
            .config(Arc::new(config))
            .build()
            .await
            .unwrap()
    }

    fn ctx() -> Context {
        Context::new("c1", "application/json", ResourcesBuilder::new().build())
    }

    #[tokio::test]
    async fn test_failed_send_with_persist_sets_retry_data() {
        let sender = sender(config(true)).await;
        let mut ctx = ctx();
        let result = sender
            .handle(&mut ctx, Some(Value::Text("payload".to_string())))
            .await;
        assert!(result.is_err());
        assert_eq!(ctx.retry_data().unwrap().payload, b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_failed_send_without_persist() {
        let sender = sender(config(false)).await;
        let mut ctx = ctx();
        let result = sender
            .handle(&mut ctx, Some(Value::Text("payload".to_string())))
            .await;
        assert!(result.is_err());
        assert!(ctx.retry_data().is_none());
    }

    #[tokio::test]
    async fn test_no_data_received() {
        let sender = sender(config(true)).await;
        let mut ctx = ctx();
        let err = sender.handle(&mut ctx, None).await.unwrap_err();
        assert_eq!(err.to_string(), "No Data Received");
        assert!(ctx.retry_data().is_none());
    }

    #[tokio::test]
    async fn test_marshal_failure() {
        let sender = sender(config(true)).await;
        let mut unmarshalable = HashMap::new();
        unmarshalable.insert(vec![1u8], 2);
        let err = sender
            .handle(&mut ctx(), Some(Value::structured(unmarshalable)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Value(value::Error::Marshal { .. })));
    }

    /// Installs a connection over an event loop nobody polls.
    async fn install(sender: &Sender, connected: bool, driver: JoinHandle<()>) -> EventLoop {
        let options = rumqttc::MqttOptions::new("edgeflow-sender-test", "127.0.0.1", 1);
        let (client, eventloop) = AsyncClient::new(options, 1);
        *sender.connection.lock().await = Some(Connection {
            client,
            driver,
            connected: Arc::new(AtomicBool::new(connected)),
        });
        eventloop
    }

    fn running() -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    #[tokio::test]
    async fn test_disconnected_broker_fails_fast() {
        let sender = sender(config(true)).await;
        let _eventloop = install(&sender, false, running()).await;

        let mut ctx = ctx();
        let err = sender
            .handle(&mut ctx, Some(Value::Text("payload".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert_eq!(ctx.retry_data().unwrap().payload, b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_full_request_queue_fails_instead_of_blocking() {
        let sender = sender(config(true)).await;
        let _eventloop = install(&sender, true, running()).await;

        let mut ctx = ctx();
        let flow = sender
            .handle(&mut ctx, Some(Value::Text("first".to_string())))
            .await
            .unwrap();
        assert!(matches!(flow, Flow::Pending));
        assert!(ctx.retry_data().is_none());

        let mut ctx = self::ctx();
        let err = sender
            .handle(&mut ctx, Some(Value::Text("second".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
        assert_eq!(ctx.retry_data().unwrap().payload, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_finished_driver_triggers_reconnect() {
        let sender = sender(config(true)).await;
        let finished = tokio::spawn(async {});
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }
        let _eventloop = install(&sender, true, finished).await;

        let mut ctx = ctx();
        let err = sender
            .handle(&mut ctx, Some(Value::Text("payload".to_string())))
            .await
            .unwrap_err();
        // The dead connection is dropped and a new connect is attempted.
        assert!(matches!(err, Error::Client(_)));
        assert!(sender.connection.lock().await.is_none());
        assert_eq!(ctx.retry_data().unwrap().payload, b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_shutdown_drops_connection() {
        let sender = sender(config(false)).await;
        let _eventloop = install(&sender, true, running()).await;
        sender.shutdown().await;
        assert!(sender.connection.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_builder_validation() {
        let mut invalid = config(false);
        invalid.broker.qos = 7;
        let result = SenderBuilder::new().config(Arc::new(invalid)).build().await;
        assert!(matches!(
            result,
            Err(Error::Client(client::Error::InvalidQos(7)))
        ));

        let mut invalid = config(false);
        invalid.topic = String::new();
        let result = SenderBuilder::new().config(Arc::new(invalid)).build().await;
        assert!(matches!(result, Err(Error::EmptyTopic)));

        let mut invalid = config(false);
        invalid.cert_file = Some("cert.pem".into());
        let result = SenderBuilder::new().config(Arc::new(invalid)).build().await;
        assert!(matches!(result, Err(Error::IncompleteKeyPair)));
    }

    #[tokio::test]
    async fn test_builder_reads_key_pair_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        std::fs::write(&cert_file, "CERT").unwrap();
        std::fs::write(&key_file, "KEY").unwrap();

        let mut with_pair = config(false);
        with_pair.cert_file = Some(cert_file);
        with_pair.key_file = Some(key_file.clone());
        assert!(SenderBuilder::new()
            .config(Arc::new(with_pair))
            .build()
            .await
            .is_ok());

        let mut missing = config(false);
        missing.cert_file = Some(dir.path().join("absent.pem"));
        missing.key_file = Some(key_file);
        let result = SenderBuilder::new().config(Arc::new(missing)).build().await;
        assert!(matches!(
            result,
            Err(Error::Client(client::Error::ReadCertificate { .. }))
        ));
    }
}
