//! Converts events to JSON or XML text.

use crate::context::Context;
use crate::envelope::{CONTENT_TYPE_JSON, CONTENT_TYPE_XML};
use crate::event::{self, Event};
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("JSON serialization/deserialization failed: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::error::Error,
    },
    #[error("XML serialization failed: {source}")]
    SerdeXml {
        #[source]
        source: quick_xml::de::DeError,
    },
    #[error(transparent)]
    Event(#[from] event::Error),
    #[error(transparent)]
    Value(#[from] value::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Xml,
}

#[derive(Debug)]
pub struct Conversion {
    format: Format,
}

impl Conversion {
    pub fn to_json() -> Self {
        Conversion {
            format: Format::Json,
        }
    }

    /// Serializes to an `<Event>` document, readings as repeated `<readings>` elements.
    pub fn to_xml() -> Self {
        Conversion {
            format: Format::Xml,
        }
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let event = Event::from_value(value::require(input)?, ctx.content_type())?;
        let (text, content_type) = match self.format {
            Format::Json => (
                serde_json::to_string(&event).map_err(|source| Error::SerdeJson { source })?,
                CONTENT_TYPE_JSON,
            ),
            Format::Xml => (
                quick_xml::se::to_string(&event).map_err(|source| Error::SerdeXml { source })?,
                CONTENT_TYPE_XML,
            ),
        };
        ctx.set_content_type(content_type);
        Ok(Flow::Continue(Value::Text(text)))
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Conversion {
    fn name(&self) -> &str {
        match self.format {
            Format::Json => "transform_to_json",
            Format::Xml => "transform_to_xml",
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
    use crate::envelope::CONTENT_TYPE_CBOR;

    #[test]
    fn test_event_to_json() {
        let mut ctx = Context::new("c1", "application/json", ResourcesBuilder::new().build());
        let event = Event {
            device: "d1".to_string(),
            ..Default::default()
        };
        let Flow::Continue(Value::Text(json)) =
            Conversion::to_json().handle(&mut ctx, Some(Value::Event(event.clone()))).unwrap()
        else {
            panic!("expected text");
        };
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(ctx.content_type(), CONTENT_TYPE_JSON);
    }

    #[test]
    fn test_cbor_input_is_rejected() {
        let mut ctx = Context::new("c1", CONTENT_TYPE_CBOR, ResourcesBuilder::new().build());
        let err = Conversion::to_json()
            .handle(&mut ctx, Some(Value::Bytes(vec![0xa1])))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Event(event::Error::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_event_to_xml() {
        let mut ctx = Context::new("c1", "application/json", ResourcesBuilder::new().build());
        let input = Value::Text(
            r#"{"device":"d1","origin":7,"readings":[{"name":"temperature","value":"21"}]}"#
                .to_string(),
        );
        let Flow::Continue(Value::Text(xml)) = Conversion::to_xml().handle(&mut ctx, Some(input)).unwrap()
        else {
            panic!("expected text");
        };
        assert!(xml.starts_with("<Event>"), "{xml}");
        assert!(xml.contains("<device>d1</device>"), "{xml}");
        assert!(xml.contains("<origin>7</origin>"), "{xml}");
        assert!(xml.contains("<name>temperature</name>"), "{xml}");
        assert!(xml.ends_with("</Event>"), "{xml}");
        assert_eq!(ctx.content_type(), CONTENT_TYPE_XML);
        assert_eq!(Conversion::to_xml().name(), "transform_to_xml");
    }
}
