//! Filters data by evaluating a JSONLogic rule against it.

use crate::context::Context;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid JSONLogic rule: {source}")]
    InvalidRule {
        #[source]
        source: serde_json::Error,
    },
    #[error("Input is not a JSON document: {source}")]
    InvalidInput {
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to evaluate JSONLogic rule: {0}")]
    Evaluate(String),
    #[error(transparent)]
    Value(#[from] value::Error),
}

/// Passes the input on unchanged when the rule holds, stops the chain otherwise.
#[derive(Debug)]
pub struct JsonLogic {
    rule: serde_json::Value,
}

impl JsonLogic {
    pub fn new(rule: &str) -> Result<Self, Error> {
        let rule = serde_json::from_str(rule).map_err(|source| Error::InvalidRule { source })?;
        Ok(JsonLogic { rule })
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let input = value::require(input)?;
        let data = match &input {
            Value::Json(json) => json.clone(),
            Value::Event(event) => {
                serde_json::to_value(event).map_err(|source| Error::InvalidInput { source })?
            }
            other => serde_json::from_slice(&other.to_bytes()?)
                .map_err(|source| Error::InvalidInput { source })?,
        };

        let result = jsonlogic_rs::apply(&self.rule, &data)
            .map_err(|err| Error::Evaluate(err.to_string()))?;
        if truthy(&result) {
            Ok(Flow::Continue(input))
        } else {
            debug!(correlation_id = %ctx.correlation_id(), "Data did not match JSONLogic rule");
            Ok(Flow::Stop)
        }
    }
}

/// JSONLogic truthiness: `false`, `null`, `0`, `""` and `[]` are false.
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(_) => true,
    }
}

#[async_trait::async_trait]
impl PipelineFunction for JsonLogic {
    fn name(&self) -> &str {
        "json_logic"
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).map_err(Into::into)
    }
}
