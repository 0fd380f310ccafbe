//! Event filters by device name or reading name.

use crate::context::Context;
use crate::event::{self, Event};
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Event(#[from] event::Error),
    #[error(transparent)]
    Value(#[from] value::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    DeviceName,
    ReadingName,
}

#[derive(Debug)]
pub struct Filter {
    target: Target,
    values: Vec<String>,
    filter_out: bool,
}

impl Filter {
    /// Keeps events from the listed devices, or drops them when `filter_out` is set.
    pub fn by_device_name(device_names: Vec<String>, filter_out: bool) -> Self {
        Filter {
            target: Target::DeviceName,
            values: device_names,
            filter_out,
        }
    }

    /// Keeps the listed readings, or drops them when `filter_out` is set.
    pub fn by_reading_name(reading_names: Vec<String>, filter_out: bool) -> Self {
        Filter {
            target: Target::ReadingName,
            values: reading_names,
            filter_out,
        }
    }

    fn keeps(&self, name: &str) -> bool {
        self.values.iter().any(|value| value == name) != self.filter_out
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let mut event = Event::from_value(value::require(input)?, ctx.content_type())?;

        // An empty filter list passes everything through.
        if self.values.is_empty() {
            return Ok(Flow::Continue(Value::Event(event)));
        }

        match self.target {
            Target::DeviceName => {
                if self.keeps(&event.device) {
                    Ok(Flow::Continue(Value::Event(event)))
                } else {
                    debug!(correlation_id = %ctx.correlation_id(), device = %event.device, "Event filtered out");
                    Ok(Flow::Stop)
                }
            }
            Target::ReadingName => {
                event.readings.retain(|reading| self.keeps(&reading.name));
                if event.readings.is_empty() {
                    debug!(correlation_id = %ctx.correlation_id(), device = %event.device, "All readings filtered out");
                    Ok(Flow::Stop)
                } else {
                    Ok(Flow::Continue(Value::Event(event)))
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Filter {
    fn name(&self) -> &str {
        match self.target {
            Target::DeviceName => "filter_by_device_name",
            Target::ReadingName => "filter_by_reading_name",
        }
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourcesBuilder;
    use crate::event::Reading;

    fn ctx() -> Context {
        Context::new("c1", "application/json", ResourcesBuilder::new().build())
    }

    fn event(device: &str, readings: &[&str]) -> Value {
        Value::Event(Event {
            device: device.to_string(),
            readings: readings
                .iter()
                .map(|name| Reading {
                    name: name.to_string(),
                    value: "1".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_device_filter() {
        let filter = Filter::by_device_name(vec!["d1".to_string()], false);
        assert!(matches!(
            filter.handle(&mut ctx(), Some(event("d1", &["r"]))).unwrap(),
            Flow::Continue(_)
        ));
        assert!(matches!(
            filter.handle(&mut ctx(), Some(event("d2", &["r"]))).unwrap(),
            Flow::Stop
        ));
    }

    #[test]
    fn test_device_filter_out() {
        let filter = Filter::by_device_name(vec!["d1".to_string()], true);
        assert!(matches!(
            filter.handle(&mut ctx(), Some(event("d1", &["r"]))).unwrap(),
            Flow::Stop
        ));
        assert!(matches!(
            filter.handle(&mut ctx(), Some(event("d2", &["r"]))).unwrap(),
            Flow::Continue(_)
        ));
    }

    #[test]
    fn test_reading_filter_keeps_matching_readings() {
        let filter = Filter::by_reading_name(vec!["temperature".to_string()], false);
        let flow = filter
            .handle(&mut ctx(), Some(event("d1", &["temperature", "humidity"])))
            .unwrap();
        let Flow::Continue(Value::Event(event)) = flow else {
            panic!("expected an event");
        };
        assert_eq!(event.readings.len(), 1);
        assert_eq!(event.readings[0].name, "temperature");
    }

    #[test]
    fn test_reading_filter_stops_when_nothing_remains() {
        let filter = Filter::by_reading_name(vec!["pressure".to_string()], false);
        assert!(matches!(
            filter.handle(&mut ctx(), Some(event("d1", &["temperature"]))).unwrap(),
            Flow::Stop
        ));
    }

    #[test]
    fn test_decodes_json_bytes() {
        let filter = Filter::by_device_name(vec!["d1".to_string()], false);
        let input = Value::Bytes(br#"{"device":"d1","readings":[]}"#.to_vec());
        assert!(matches!(
            filter.handle(&mut ctx(), Some(input)).unwrap(),
            Flow::Continue(Value::Event(_))
        ));
    }

    #[test]
    fn test_no_data() {
        let filter = Filter::by_device_name(vec![], false);
        let err = filter.handle(&mut ctx(), None).unwrap_err();
        assert_eq!(err.to_string(), "No Data Received");
    }
}
