//! Carries a timer-flushed batch through the stages that follow it.

use crate::batch::FlushSink;
use crate::context::{Context, Resources};
use crate::envelope::{new_correlation_id, CONTENT_TYPE_JSON};
use crate::publisher::{BackgroundPublisher, OutputRoute};
use crate::retry::{self, RetryStore};
use crate::runtime::{Completion, Runtime};
use crate::value::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Flush sink that runs the pipeline tail with a fresh context.
///
/// The output of the tail, when any, is republished through the background
/// publisher, or through the trigger's output route when there is none.
/// Retry data goes to the retry store.
#[derive(Debug, Clone)]
pub struct Continuation {
    tail: Option<Arc<Runtime>>,
    resources: Arc<Resources>,
    publisher: Option<BackgroundPublisher>,
    output: OutputRoute,
    retry_store: Option<Arc<dyn RetryStore>>,
}

#[derive(Default, Debug)]
pub struct ContinuationBuilder {
    tail: Option<Arc<Runtime>>,
    resources: Option<Arc<Resources>>,
    publisher: Option<BackgroundPublisher>,
    output: Option<OutputRoute>,
    retry_store: Option<Arc<dyn RetryStore>>,
}

impl ContinuationBuilder {
    pub fn new() -> ContinuationBuilder {
        ContinuationBuilder {
            ..Default::default()
        }
    }

    /// Stages after the batch stage. Omitted when the batch is the last stage.
    pub fn tail(mut self, tail: Arc<Runtime>) -> Self {
        self.tail = Some(tail);
        self
    }

    pub fn resources(mut self, resources: Arc<Resources>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn publisher(mut self, publisher: BackgroundPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// The route the trigger publishes inbound output on.
    pub fn output_route(mut self, output: OutputRoute) -> Self {
        self.output = Some(output);
        self
    }

    pub fn retry_store(mut self, retry_store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = Some(retry_store);
        self
    }

    pub fn build(self) -> Continuation {
        let resources = self
            .resources
            .or_else(|| self.tail.as_ref().map(|tail| Arc::clone(tail.resources())))
            .unwrap_or_default();
        Continuation {
            tail: self.tail,
            resources,
            publisher: self.publisher,
            output: self.output.unwrap_or_default(),
            retry_store: self.retry_store,
        }
    }
}

impl Continuation {
    async fn run_tail(&self, ctx: &mut Context, batch: Value) -> Option<Vec<u8>> {
        let Some(tail) = &self.tail else {
            return match batch.into_bytes() {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    error!(correlation_id = %ctx.correlation_id(), "Failed to encode flushed batch: {}", err);
                    None
                }
            };
        };
        match tail.process_from(ctx, 0, batch).await {
            Ok(Completion::Finished) => ctx.take_output_data(),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl FlushSink for Continuation {
    async fn flush(&self, batch: Value, count: usize) {
        let mut ctx = Context::new(
            new_correlation_id(),
            CONTENT_TYPE_JSON,
            Arc::clone(&self.resources),
        );
        debug!(correlation_id = %ctx.correlation_id(), count, "Continuing flushed batch");

        let output = self.run_tail(&mut ctx, batch).await;
        retry::surface(&mut ctx, self.retry_store.as_deref()).await;

        let Some(output) = output else {
            return;
        };
        match &self.publisher {
            Some(publisher) => {
                if let Err(err) = publisher
                    .publish(output, ctx.correlation_id(), ctx.content_type())
                    .await
                {
                    error!(correlation_id = %ctx.correlation_id(), "Failed to publish flushed batch: {}", err);
                }
            }
            None => {
                if !self
                    .output
                    .publish(output, ctx.correlation_id(), ctx.content_type())
                    .await
                {
                    warn!(
                        correlation_id = %ctx.correlation_id(),
                        "Flushed batch produced output but no publish path is configured; dropping"
                    );
                }
            }
        }
    }
}
