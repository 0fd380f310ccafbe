//! Sequential executor for a configured chain of pipeline functions.

use crate::context::{Context, Resources};
use crate::envelope::Envelope;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::Value;
use std::sync::Arc;
use tracing::{debug, error, trace};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Pipeline function {name} at position {position} failed: {source}")]
    Function {
        position: usize,
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("Pipeline has no functions configured")]
    EmptyPipeline,
}

/// Terminal state of one invocation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every function continued. Output data may be set.
    Finished,
    /// The function at `position` had nothing to hand on yet.
    Pending { position: usize },
    /// The function at `position` short-circuited the chain.
    Stopped { position: usize },
}

pub struct Runtime {
    functions: Vec<Arc<dyn PipelineFunction>>,
    resources: Arc<Resources>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field(
                "functions",
                &self.functions.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("resources", &self.resources)
            .finish()
    }
}

impl Runtime {
    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Builds the initial context for an inbound envelope.
    pub fn context(&self, envelope: &Envelope) -> Context {
        Context::from_envelope(envelope, Arc::clone(&self.resources))
    }

    /// Runs the whole chain with the envelope payload as first input.
    pub async fn process(&self, ctx: &mut Context, envelope: &Envelope) -> Result<Completion, Error> {
        trace!(
            correlation_id = %ctx.correlation_id(),
            size = envelope.payload().len(),
            "Processing envelope"
        );
        self.process_from(ctx, 0, Value::Bytes(envelope.payload().to_vec()))
            .await
    }

    /// Runs the chain starting at `start` with `input` as that stage's input.
    pub async fn process_from(
        &self,
        ctx: &mut Context,
        start: usize,
        input: Value,
    ) -> Result<Completion, Error> {
        let last = self.functions.len().saturating_sub(1);
        let mut input = Some(input);

        for (position, function) in self.functions.iter().enumerate().skip(start) {
            let flow = match function.process(ctx, input.take()).await {
                Ok(flow) => flow,
                Err(source) => return Err(self.fail(ctx, position, function.name(), source)),
            };

            match flow {
                Flow::Continue(value) if position == last => match value.into_bytes() {
                    Ok(bytes) => ctx.set_output_data(bytes),
                    Err(source) => {
                        return Err(self.fail(ctx, position, function.name(), source.into()))
                    }
                },
                Flow::Continue(value) => input = Some(value),
                Flow::Pending => {
                    debug!(
                        correlation_id = %ctx.correlation_id(),
                        pipeline = %self.resources.name,
                        function = function.name(),
                        position,
                        "Pipeline pending"
                    );
                    return Ok(Completion::Pending { position });
                }
                Flow::Stop => {
                    debug!(
                        correlation_id = %ctx.correlation_id(),
                        pipeline = %self.resources.name,
                        function = function.name(),
                        position,
                        "Pipeline stopped"
                    );
                    return Ok(Completion::Stopped { position });
                }
            }
        }

        Ok(Completion::Finished)
    }

    fn fail(&self, ctx: &Context, position: usize, name: &str, source: BoxError) -> Error {
        error!(
            correlation_id = %ctx.correlation_id(),
            pipeline = %self.resources.name,
            function = name,
            position,
            "Pipeline function failed: {}",
            source
        );
        Error::Function {
            position,
            name: name.to_string(),
            source,
        }
    }

    /// Shuts every function down, cancelling batch timers.
    pub async fn shutdown(&self) {
        for function in &self.functions {
            function.shutdown().await;
        }
        debug!(pipeline = %self.resources.name, "Pipeline shut down");
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    functions: Vec<Arc<dyn PipelineFunction>>,
    resources: Option<Arc<Resources>>,
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder {
            ..Default::default()
        }
    }

    pub fn function(mut self, function: Arc<dyn PipelineFunction>) -> Self {
        self.functions.push(function);
        self
    }

    pub fn functions(mut self, functions: Vec<Arc<dyn PipelineFunction>>) -> Self {
        self.functions.extend(functions);
        self
    }

    pub fn resources(mut self, resources: Arc<Resources>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        if self.functions.is_empty() {
            return Err(Error::EmptyPipeline);
        }
        Ok(Runtime {
            functions: self.functions,
            resources: self.resources.unwrap_or_default(),
        })
    }
}
