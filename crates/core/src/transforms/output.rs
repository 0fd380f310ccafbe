//! Sets the pipeline output data.

use crate::context::Context;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use tracing::debug;

#[derive(Debug, Default)]
pub struct OutputData {
    response_content_type: Option<String>,
}

impl OutputData {
    pub fn new(response_content_type: Option<String>) -> Self {
        OutputData {
            response_content_type: response_content_type.filter(|c| !c.is_empty()),
        }
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, value::Error> {
        let data = value::require(input)?.into_bytes()?;
        if let Some(content_type) = &self.response_content_type {
            ctx.set_content_type(content_type.clone());
        }
        debug!(correlation_id = %ctx.correlation_id(), size = data.len(), "Setting output data");
        ctx.set_output_data(data.clone());
        Ok(Flow::Continue(Value::Bytes(data)))
    }
}

#[async_trait::async_trait]
impl PipelineFunction for OutputData {
    fn name(&self) -> &str {
        "set_output_data"
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).map_err(Into::into)
    }
}
