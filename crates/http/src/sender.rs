//! HTTP sender that POSTs or PUTs the stage input to an endpoint.
//!
//! Honors the persist-on-error contract: a failed send marks the exact bytes
//! for retry on the context when `persist_on_error` is set.

use crate::config::{Credentials, Method};
use edgeflow_core::{
    context::Context,
    envelope::CONTENT_TYPE_JSON,
    function::{BoxError, Flow, PipelineFunction},
    secret,
    value::{self, Value},
};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error};

/// Errors that can occur while sending over HTTP.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("HTTP Header Secret Name was provided but no SecretPath was provided")]
    SecretPathMissing,
    #[error("SecretPath was specified but no header name was provided")]
    SecretHeaderNameMissing,
    #[error("No secret provider is configured for secret path {0}")]
    NoSecretProvider(String),
    #[error(transparent)]
    Secret(#[from] secret::Error),
    #[error("Secret {key} was not returned for path {path}")]
    SecretNotReturned { path: String, key: String },
    #[error(transparent)]
    Value(#[from] value::Error),
    #[error("Failed to read credentials file at {path} with error: {source}")]
    ReadCredentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON serialization/deserialization failed with error: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("HTTP request failed with error: {source}")]
    Reqwest {
        #[source]
        source: reqwest::Error,
    },
    #[error("Invalid HTTP header name with error: {source}")]
    ReqwestInvalidHeaderName {
        #[source]
        source: reqwest::header::InvalidHeaderName,
    },
    #[error("Invalid HTTP header value with error: {source}")]
    ReqwestInvalidHeaderValue {
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    #[error("export failed with {status} HTTP status code from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

#[derive(Debug)]
struct SecretHeader {
    name: HeaderName,
    /// Secret key, the header name as configured.
    key: String,
    path: String,
}

/// HTTP sender pipeline function.
#[derive(Debug)]
pub struct Sender {
    /// HTTP client instance.
    client: reqwest::Client,
    /// Sender configuration.
    config: Arc<crate::config::Sender>,
    method: Method,
    mime_type: HeaderValue,
    secret_header: Option<SecretHeader>,
}

impl Sender {
    /// Sends `data` and returns the response body.
    async fn send(&self, ctx: &Context, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut request = match self.method {
            Method::POST => self.client.post(&self.config.url),
            Method::PUT => self.client.put(&self.config.url),
        }
        .header(CONTENT_TYPE, self.mime_type.clone());

        if let Some(secret_header) = &self.secret_header {
            let value = self.secret_value(ctx, secret_header).await?;
            request = request.header(secret_header.name.clone(), value);
        }

        if let Some(credentials_path) = &self.config.credentials_path {
            let credentials_string =
                fs::read_to_string(credentials_path)
                    .await
                    .map_err(|source| Error::ReadCredentials {
                        path: credentials_path.clone(),
                        source,
                    })?;
            let credentials: Credentials = serde_json::from_str(&credentials_string)
                .map_err(|source| Error::SerdeJson { source })?;
            if let Some(bearer_token) = credentials.bearer_auth {
                request = request.bearer_auth(bearer_token);
            }
            if let Some(basic_auth) = credentials.basic_auth {
                request = request.basic_auth(basic_auth.username, Some(basic_auth.password));
            }
        }

        let response = request
            .body(data)
            .send()
            .await
            .map_err(|source| Error::Reqwest { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status,
                url: self.config.url.clone(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Reqwest { source })?;
        Ok(body.to_vec())
    }

    async fn secret_value(
        &self,
        ctx: &Context,
        secret_header: &SecretHeader,
    ) -> Result<HeaderValue, Error> {
        let provider = ctx
            .secrets()
            .ok_or_else(|| Error::NoSecretProvider(secret_header.path.clone()))?;
        let key = secret_header.key.as_str();
        let mut secrets = provider.get_secrets(&secret_header.path, &[key]).await?;
        let value = secrets
            .remove(key)
            .ok_or_else(|| Error::SecretNotReturned {
                path: secret_header.path.clone(),
                key: key.to_string(),
            })?;
        HeaderValue::try_from(value).map_err(|source| Error::ReqwestInvalidHeaderValue { source })
    }

    async fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let data = value::require(input)?.into_bytes()?;
        debug!(
            correlation_id = %ctx.correlation_id(),
            url = %self.config.url,
            method = ?self.method,
            size = data.len(),
            "Sending HTTP request"
        );

        match self.send(ctx, data.clone()).await {
            Ok(body) => Ok(Flow::Continue(Value::Bytes(body))),
            Err(err) => {
                error!(
                    correlation_id = %ctx.correlation_id(),
                    url = %self.config.url,
                    persist = self.config.persist_on_error,
                    "{}",
                    err
                );
                if self.config.persist_on_error {
                    ctx.set_retry_data(data);
                }
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Sender {
    fn name(&self) -> &str {
        match self.method {
            Method::POST => "http_post",
            Method::PUT => "http_put",
        }
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).await.map_err(Into::into)
    }
}

/// Builder for the HTTP sender.
#[derive(Default)]
pub struct SenderBuilder {
    config: Option<Arc<crate::config::Sender>>,
    method: Method,
    client: Option<reqwest::Client>,
}

impl SenderBuilder {
    pub fn new() -> SenderBuilder {
        SenderBuilder {
            ..Default::default()
        }
    }

    pub fn config(mut self, config: Arc<crate::config::Sender>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Shares an HTTP client between senders. A default client is built when omitted.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<Sender, Error> {
        let config = self
            .config
            .ok_or_else(|| Error::MissingRequiredAttribute("config".to_string()))?;

        let header_name = config
            .secret_header_name
            .as_deref()
            .filter(|name| !name.is_empty());
        let secret_path = config.secret_path.as_deref().filter(|path| !path.is_empty());
        let secret_header = match (header_name, secret_path) {
            (Some(name), Some(path)) => Some(SecretHeader {
                name: HeaderName::try_from(name)
                    .map_err(|source| Error::ReqwestInvalidHeaderName { source })?,
                key: name.to_string(),
                path: path.to_string(),
            }),
            (Some(_), None) => return Err(Error::SecretPathMissing),
            (None, Some(_)) => return Err(Error::SecretHeaderNameMissing),
            (None, None) => None,
        };

        let mime_type = match config.mime_type.as_str() {
            "" => HeaderValue::from_static(CONTENT_TYPE_JSON),
            mime_type => HeaderValue::try_from(mime_type)
                .map_err(|source| Error::ReqwestInvalidHeaderValue { source })?,
        };

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(|source| Error::Reqwest { source })?,
        };

        Ok(Sender {
            client,
            config,
            method: self.method,
            mime_type,
            secret_header,
        })
    }
}
