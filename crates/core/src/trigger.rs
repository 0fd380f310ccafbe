//! Trigger lifecycle shared by the transport crates.

use crate::envelope::Envelope;
use crate::publisher::{BackgroundReceiver, OutputRoute};
use crate::retry::{self, RetryStore};
use crate::runtime::{Completion, Runtime};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Connection state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Uninitialized,
    Connecting,
    Connected,
    Subscribed,
    Running,
    ShuttingDown,
    Stopped,
}

/// Publishes state transitions to any number of observers.
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<TriggerState>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        let (tx, _) = watch::channel(TriggerState::Uninitialized);
        StateTracker { tx: Arc::new(tx) }
    }
}

impl StateTracker {
    pub fn set(&self, state: TriggerState) {
        let previous = self.tx.send_replace(state);
        debug!(from = ?previous, to = ?state, "Trigger state changed");
    }

    pub fn get(&self) -> TriggerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TriggerState> {
        self.tx.subscribe()
    }
}

type DeferredAction = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Teardown returned by [`Trigger::initialize`]. Consumed when run, so it runs at most once.
pub struct Deferred {
    action: DeferredAction,
}

impl Deferred {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Deferred {
            action: Box::new(move || Box::pin(action())),
        }
    }

    pub async fn run(self) {
        (self.action)().await
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait Trigger: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connects, subscribes and starts dispatching messages to the runtime.
    async fn initialize(
        &mut self,
        background: Option<BackgroundReceiver>,
    ) -> Result<Deferred, Self::Error>;

    fn state(&self) -> watch::Receiver<TriggerState>;
}

/// Runs one inbound envelope through the runtime and surfaces its retry data.
#[derive(Debug, Clone)]
pub struct MessageHandler {
    runtime: Arc<Runtime>,
    retry_store: Option<Arc<dyn RetryStore>>,
    output: OutputRoute,
}

impl MessageHandler {
    pub fn new(runtime: Arc<Runtime>, retry_store: Option<Arc<dyn RetryStore>>) -> Self {
        MessageHandler {
            runtime,
            retry_store,
            output: OutputRoute::default(),
        }
    }

    /// Shares `output` with the trigger, so batch continuations built over
    /// the same route publish where inbound messages do.
    pub fn with_output_route(mut self, output: OutputRoute) -> Self {
        self.output = output;
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn output_route(&self) -> &OutputRoute {
        &self.output
    }

    /// Handles `envelope` and publishes its output through the output route.
    ///
    /// Publishes only when the chain finished with output and the trigger
    /// attached a sink. Returns whether output was handed to the sink.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        let correlation_id = envelope.correlation_id().to_string();
        let Some((output, content_type)) = self.handle(envelope).await else {
            return false;
        };
        let routed = self
            .output
            .publish(output, &correlation_id, &content_type)
            .await;
        if !routed {
            trace!(correlation_id = %correlation_id, "No publish topic configured, output not published");
        }
        routed
    }

    /// Returns the output data and its content type when the chain finished with output.
    pub async fn handle(&self, envelope: Envelope) -> Option<(Vec<u8>, String)> {
        let mut ctx = self.runtime.context(&envelope);
        trace!(
            correlation_id = %ctx.correlation_id(),
            content_type = %ctx.content_type(),
            "Received message"
        );
        // Runtime errors are logged by the runtime itself.
        let result = self.runtime.process(&mut ctx, &envelope).await;
        retry::surface(&mut ctx, self.retry_store.as_deref()).await;

        match result {
            Ok(Completion::Finished) => {
                let content_type = ctx.content_type().to_string();
                ctx.take_output_data().map(|output| (output, content_type))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::envelope::EnvelopeBuilder;
    use crate::function::{BoxError, Flow, PipelineFunction};
    use crate::publisher::tests::RecordingSink;
    use crate::retry::MemoryRetryStore;
    use crate::runtime::RuntimeBuilder;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait::async_trait]
    impl PipelineFunction for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
            let bytes = input.ok_or("No Data Received")?.into_bytes()?;
            if bytes == b"fail" {
                ctx.set_retry_data(bytes);
                return Err("send failed".into());
            }
            Ok(Flow::Continue(Value::Bytes(bytes)))
        }
    }

    fn handler(store: Arc<MemoryRetryStore>) -> MessageHandler {
        let runtime = RuntimeBuilder::new()
            .function(Arc::new(Echo))
            .build()
            .unwrap();
        MessageHandler::new(Arc::new(runtime), Some(store as Arc<dyn RetryStore>))
    }

    #[tokio::test]
    async fn test_handle_returns_output() {
        let store = Arc::new(MemoryRetryStore::new());
        let envelope = EnvelopeBuilder::new()
            .payload(br#"{"a":1}"#.to_vec())
            .build()
            .unwrap();
        let (output, content_type) = handler(store.clone()).handle(envelope).await.unwrap();
        assert_eq!(output, br#"{"a":1}"#.to_vec());
        assert_eq!(content_type, "application/json");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_surfaces_retry_data() {
        let store = Arc::new(MemoryRetryStore::new());
        let envelope = EnvelopeBuilder::new()
            .payload(b"fail".to_vec())
            .build()
            .unwrap();
        assert!(handler(store.clone()).handle(envelope).await.is_none());
        let objects = store.drain();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].payload, b"fail".to_vec());
    }

    fn routed_handler(store: Arc<MemoryRetryStore>, sink: Option<Arc<RecordingSink>>) -> MessageHandler {
        let route = OutputRoute::new();
        if let Some(sink) = sink {
            route.attach(sink);
        }
        handler(store).with_output_route(route)
    }

    fn envelope(payload: &[u8]) -> Envelope {
        EnvelopeBuilder::new()
            .payload(payload.to_vec())
            .correlation_id("c1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_publishes_finished_output() {
        let sink = Arc::new(RecordingSink::default());
        let handler = routed_handler(Arc::new(MemoryRetryStore::new()), Some(sink.clone()));

        assert!(handler.dispatch(envelope(br#"{"a":1}"#)).await);
        assert_eq!(
            *sink.published.lock().unwrap(),
            vec![(
                br#"{"a":1}"#.to_vec(),
                "c1".to_string(),
                "application/json".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_dispatch_skips_failed_chain() {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryRetryStore::new());
        let handler = routed_handler(store.clone(), Some(sink.clone()));

        assert!(!handler.dispatch(envelope(b"fail")).await);
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_publish_topic() {
        let handler = routed_handler(Arc::new(MemoryRetryStore::new()), None);
        assert!(!handler.dispatch(envelope(br#"{"a":1}"#)).await);
    }

    #[tokio::test]
    async fn test_dispatch_carries_on_after_publish_failure() {
        let failing = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let handler = routed_handler(Arc::new(MemoryRetryStore::new()), Some(failing));

        assert!(handler.dispatch(envelope(br#"{"a":1}"#)).await);
        let sink = Arc::new(RecordingSink::default());
        handler.output_route().attach(sink.clone());
        assert!(handler.dispatch(envelope(br#"{"b":2}"#)).await);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let deferred = Deferred::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        deferred.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_tracker() {
        let tracker = StateTracker::default();
        let receiver = tracker.subscribe();
        assert_eq!(tracker.get(), TriggerState::Uninitialized);
        tracker.set(TriggerState::Connecting);
        assert_eq!(*receiver.borrow(), TriggerState::Connecting);
    }
}
