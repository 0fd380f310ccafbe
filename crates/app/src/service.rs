//! Wires configuration into a running trigger, pipeline and runtime.

use crate::config::{AppConfig, Trigger};
use crate::pipeline::{self, PipelineBuilder};
use edgeflow_core::{
    context::ResourcesBuilder,
    publisher::{self, background_publisher, BackgroundReceiver, OutputRoute},
    retry::{MemoryRetryStore, RetryStore},
    runtime::{self, Runtime, RuntimeBuilder},
    secret::FileSecretProvider,
    trigger::{Deferred, MessageHandler, Trigger as _},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
    #[error(transparent)]
    Runtime(#[from] runtime::Error),
    #[error(transparent)]
    Publisher(#[from] publisher::Error),
    #[error("Retry capacity must be greater than zero")]
    InvalidRetryCapacity,
    #[error("Failed to build HTTP client: {source}")]
    HttpClient {
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    MqttTrigger(#[from] edgeflow_mqtt::trigger::Error),
    #[error(transparent)]
    MessageBusTrigger(#[from] edgeflow_nats::trigger::Error),
}

/// Configured trigger, one variant per transport.
#[derive(Debug)]
enum TriggerKind {
    Mqtt(edgeflow_mqtt::trigger::Trigger),
    MessageBus(edgeflow_nats::trigger::Trigger),
}

impl TriggerKind {
    async fn initialize(&mut self, background: Option<BackgroundReceiver>) -> Result<Deferred, Error> {
        match self {
            TriggerKind::Mqtt(trigger) => Ok(trigger.initialize(background).await?),
            TriggerKind::MessageBus(trigger) => Ok(trigger.initialize(background).await?),
        }
    }
}

/// A single-pipeline edge service.
#[derive(Debug)]
pub struct Service {
    name: String,
    trigger: TriggerKind,
    runtime: Arc<Runtime>,
    background: Option<BackgroundReceiver>,
    output: OutputRoute,
    retry_store: Option<Arc<MemoryRetryStore>>,
}

impl Service {
    /// Builds every collaborator from `config`. Nothing connects yet.
    ///
    /// Must be called from within a tokio runtime, time based batch stages start their timers here.
    #[tracing::instrument(skip_all, fields(service = %config.service.name))]
    pub async fn build(config: AppConfig) -> Result<Service, Error> {
        let mut resources = ResourcesBuilder::new().name(config.service.name.clone());
        if let Some(secret_store) = &config.secret_store {
            resources = resources.secrets(Arc::new(FileSecretProvider::new(secret_store.path.clone())));
        }
        let resources = resources.build();

        let retry_store = match config.retry.as_ref().filter(|retry| retry.enabled) {
            Some(retry) if retry.capacity == 0 => return Err(Error::InvalidRetryCapacity),
            Some(retry) => Some(Arc::new(MemoryRetryStore::with_capacity(retry.capacity))),
            None => None,
        };
        let dyn_retry_store = retry_store
            .as_ref()
            .map(|store| Arc::clone(store) as Arc<dyn RetryStore>);

        let mut http_client = reqwest::Client::builder();
        if let Some(http) = &config.http {
            http_client = http_client.timeout(Duration::from_secs(http.timeout_secs));
        }
        let http_client = http_client
            .build()
            .map_err(|source| Error::HttpClient { source })?;

        let (publisher, background) = match &config.background {
            Some(background) => {
                let (publisher, receiver) = background_publisher(background.capacity)?;
                (Some(publisher), Some(receiver))
            }
            None => (None, None),
        };

        // Attached by the trigger once connected, shared with every batch continuation.
        let output = OutputRoute::new();

        let functions = PipelineBuilder::new()
            .stages(config.pipeline.stages.clone())
            .resources(Arc::clone(&resources))
            .publisher(publisher)
            .output_route(output.clone())
            .retry_store(dyn_retry_store.clone())
            .http_client(http_client)
            .build()
            .await?;
        let runtime = Arc::new(
            RuntimeBuilder::new()
                .functions(functions)
                .resources(Arc::clone(&resources))
                .build()?,
        );
        let handler = MessageHandler::new(Arc::clone(&runtime), dyn_retry_store)
            .with_output_route(output.clone());

        let trigger = match config.trigger {
            Trigger::Mqtt(trigger) => TriggerKind::Mqtt(
                edgeflow_mqtt::trigger::TriggerBuilder::new()
                    .config(Arc::new(trigger))
                    .handler(handler)
                    .secrets(resources.secrets.clone())
                    .build()?,
            ),
            Trigger::MessageBus(trigger) => TriggerKind::MessageBus(
                edgeflow_nats::trigger::TriggerBuilder::new()
                    .config(Arc::new(trigger))
                    .handler(handler)
                    .build()?,
            ),
        };
        info!(stages = config.pipeline.stages.len(), "Service built");

        Ok(Service {
            name: config.service.name,
            trigger,
            runtime,
            background,
            output,
            retry_store,
        })
    }

    /// Payloads marked for retry, `None` when retry is disabled.
    ///
    /// The store is bounded by `retry.capacity`. Callers drain it to resend
    /// or persist what failed.
    pub fn retry_store(&self) -> Option<Arc<MemoryRetryStore>> {
        self.retry_store.clone()
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        })
        .await
    }

    /// Starts the trigger, waits for `shutdown`, then tears everything down once.
    #[tracing::instrument(skip_all, name = "service", fields(service = %self.name))]
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let deferred = match self.trigger.initialize(self.background.take()).await {
            Ok(deferred) => deferred,
            Err(err) => {
                error!("Trigger initialization failed: {}", err);
                self.runtime.shutdown().await;
                return Err(err);
            }
        };
        info!("Service running");

        shutdown.await;
        info!("Shutting down");
        deferred.run().await;
        self.output.detach();
        self.runtime.shutdown().await;

        if let Some(store) = &self.retry_store {
            if !store.is_empty() {
                warn!(pending = store.len(), "Retry store still holds payloads at shutdown");
            }
        }
        Ok(())
    }
}
