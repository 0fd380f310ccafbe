//! HTTP sender configuration structures and types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// HTTP sender configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Sender {
    /// Target endpoint URL.
    pub url: String,
    /// Content-Type of the request body. Defaults to `application/json` when empty.
    #[serde(default)]
    pub mime_type: String,
    /// Mark failed payloads for retry.
    #[serde(default)]
    pub persist_on_error: bool,
    /// Header that carries the secret fetched from the secret store.
    pub secret_header_name: Option<String>,
    /// Secret store path holding the header secret, keyed by the header name.
    pub secret_path: Option<String>,
    /// Optional path to a credentials file.
    pub credentials_path: Option<PathBuf>,
}

/// HTTP methods supported by the sender.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub enum Method {
    /// HTTP POST method (default).
    #[default]
    POST,
    /// HTTP PUT method.
    PUT,
}

/// Authentication credentials for HTTP requests.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Credentials {
    /// Bearer token for authorization header.
    pub bearer_auth: Option<String>,
    /// Basic authentication credentials.
    pub basic_auth: Option<BasicAuth>,
}

/// Basic authentication username and password.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}
