//! AES-256-CBC encryption with base64 output.

use crate::context::Context;
use crate::envelope::CONTENT_TYPE_TEXT;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// AES block size in bytes, also the required IV length.
const BLOCK_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Encryption key must not be empty")]
    EmptyKey,
    #[error("Initialization vector must be at least 16 bytes, got {0}")]
    InitVectorTooShort(usize),
    #[error(transparent)]
    Value(#[from] value::Error),
}

pub struct Encryption {
    key: [u8; 32],
    iv: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption").finish_non_exhaustive()
    }
}

impl Encryption {
    /// The key is the SHA-256 digest of `key`; the IV is the first 16 bytes of `init_vector`.
    pub fn new(key: &str, init_vector: &str) -> Result<Self, Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let iv_bytes = init_vector.as_bytes();
        if iv_bytes.len() < BLOCK_SIZE {
            return Err(Error::InitVectorTooShort(iv_bytes.len()));
        }
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&iv_bytes[..BLOCK_SIZE]);
        Ok(Encryption {
            key: Sha256::digest(key.as_bytes()).into(),
            iv,
        })
    }

    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let data = value::require(input)?.into_bytes()?;
        let encrypted = self.encrypt(&data);
        ctx.set_content_type(CONTENT_TYPE_TEXT);
        Ok(Flow::Continue(Value::Bytes(
            STANDARD.encode(encrypted).into_bytes(),
        )))
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Encryption {
    fn name(&self) -> &str {
        "encrypt_with_aes"
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).map_err(Into::into)
    }
}
