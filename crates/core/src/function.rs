//! Contract implemented by every pipeline stage.

use crate::context::Context;
use crate::value::Value;

/// Error type returned across the function boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a successful stage.
#[derive(Debug)]
pub enum Flow {
    /// Hand the value to the next stage.
    Continue(Value),
    /// Nothing to hand on yet, for example a batch still filling.
    Pending,
    /// Short-circuit the chain without an error.
    Stop,
}

#[async_trait::async_trait]
pub trait PipelineFunction: Send + Sync {
    /// Stage name used in logs and errors.
    fn name(&self) -> &str;

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError>;

    /// Releases background resources held by the stage.
    async fn shutdown(&self) {}
}
