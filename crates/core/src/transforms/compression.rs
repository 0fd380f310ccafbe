//! Gzip and zlib compression with base64 output.

use crate::context::Context;
use crate::envelope::CONTENT_TYPE_TEXT;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::Write;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Compression failed: {source}")]
    IO {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Value(#[from] value::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Zlib,
}

#[derive(Debug)]
pub struct Compression {
    algorithm: Algorithm,
}

impl Compression {
    pub fn new(algorithm: Algorithm) -> Self {
        Compression { algorithm }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let level = flate2::Compression::default();
        match self.algorithm {
            Algorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish()
            }
            Algorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let data = value::require(input)?.into_bytes()?;
        let compressed = self
            .compress(&data)
            .map_err(|source| Error::IO { source })?;
        ctx.set_content_type(CONTENT_TYPE_TEXT);
        Ok(Flow::Continue(Value::Bytes(
            STANDARD.encode(compressed).into_bytes(),
        )))
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Compression {
    fn name(&self) -> &str {
        match self.algorithm {
            Algorithm::Gzip => "compress_with_gzip",
            Algorithm::Zlib => "compress_with_zlib",
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
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    const CLEAR: &str = "This is the test string used for testing";

    fn compressed(algorithm: Algorithm) -> (Context, Vec<u8>) {
        let mut ctx = Context::new("c1", "application/json", ResourcesBuilder::new().build());
        let flow = Compression::new(algorithm)
            .handle(&mut ctx, Some(Value::Text(CLEAR.to_string())))
            .unwrap();
        let Flow::Continue(Value::Bytes(encoded)) = flow else {
            panic!("expected bytes");
        };
        (ctx, STANDARD.decode(encoded).unwrap())
    }

    #[test]
    fn test_gzip() {
        let (ctx, compressed) = compressed(Algorithm::Gzip);
        let mut decoded = String::new();
        GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, CLEAR);
        assert_eq!(ctx.content_type(), CONTENT_TYPE_TEXT);
    }

    #[test]
    fn test_zlib() {
        let (_, compressed) = compressed(Algorithm::Zlib);
        let mut decoded = String::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, CLEAR);
    }

    #[test]
    fn test_no_data() {
        let mut ctx = Context::new("c1", "application/json", ResourcesBuilder::new().build());
        let err = Compression::new(Algorithm::Gzip)
            .handle(&mut ctx, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "No Data Received");
    }
}
