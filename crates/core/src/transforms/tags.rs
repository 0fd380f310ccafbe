//! Adds configured tags to events.

use crate::config::split_list;
use crate::context::Context;
use crate::event::{self, Event};
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Bad tags specification format. Expect comma separated list of 'key:value'. Got `{0}`")]
    BadSpecification(String),
    #[error(transparent)]
    Event(#[from] event::Error),
    #[error(transparent)]
    Value(#[from] value::Error),
}

#[derive(Debug)]
pub struct Tags {
    tags: HashMap<String, String>,
}

impl Tags {
    pub fn new(tags: HashMap<String, String>) -> Self {
        Tags { tags }
    }

    /// Parses a `key:value,key2:value2` specification.
    pub fn parse(specification: &str) -> Result<Self, Error> {
        let tags = split_list(specification)
            .into_iter()
            .map(|tag| {
                let parts: Vec<&str> = tag
                    .split(':')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .collect();
                match parts.as_slice() {
                    [key, value] => Ok((key.to_string(), value.to_string())),
                    _ => Err(Error::BadSpecification(specification.to_string())),
                }
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Tags { tags })
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let mut event = Event::from_value(value::require(input)?, ctx.content_type())?;
        event
            .tags
            .extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Flow::Continue(Value::Event(event)))
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Tags {
    fn name(&self) -> &str {
        "add_tags"
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).map_err(Into::into)
    }
}
