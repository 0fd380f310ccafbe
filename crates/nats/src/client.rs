use std::path::PathBuf;
use std::time::Duration;

/// Default NATS Server host.
pub const DEFAULT_NATS_HOST: &str = "localhost:4222";

/// Used to store NATS Client credentials.
#[derive(serde::Deserialize, Default)]
struct Credentials {
    /// nKey seed string.
    nkey: Option<String>,
    /// Optional host value, overrides the configured URL.
    host: Option<String>,
    /// Username, used together with `password`.
    user: Option<String>,
    password: Option<String>,
    /// Authentication token.
    token: Option<String>,
}

/// Errors that can occur during NATS client operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to open or read the credentials file.
    #[error("Failed to read credentials file at {path} with error: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse credentials JSON file.
    #[error(transparent)]
    ParseCredentials(#[from] serde_json::Error),
    /// Failed to establish connection to server.
    #[error(transparent)]
    Connect(#[from] async_nats::ConnectError),
    /// Required configuration attribute is missing.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// NATS client for core publish/subscribe.
#[derive(Debug)]
pub struct Client {
    /// Server address, from the configuration or the credentials file.
    host: String,
    /// Optional path to the NATS credentials file.
    credentials_path: Option<PathBuf>,
    connect_timeout: Option<Duration>,
    /// Connected client, set by `connect`.
    pub nats_client: Option<async_nats::Client>,
}

impl Client {
    async fn credentials(&self) -> Result<Credentials, Error> {
        let Some(path) = &self.credentials_path else {
            return Ok(Credentials::default());
        };
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| Error::OpenFile {
                    path: path.clone(),
                    source,
                })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl edgeflow_core::client::Client for Client {
    type Error = Error;
    /// Connect to the NATS Server with provided options.
    async fn connect(mut self) -> Result<Self, Error> {
        let credentials = self.credentials().await?;

        let mut connect_options = match (credentials.nkey, credentials.user, credentials.token) {
            (Some(nkey), _, _) => async_nats::ConnectOptions::with_nkey(nkey),
            (None, Some(user), _) => async_nats::ConnectOptions::with_user_and_password(
                user,
                credentials.password.unwrap_or_default(),
            ),
            (None, None, Some(token)) => async_nats::ConnectOptions::with_token(token),
            (None, None, None) => async_nats::ConnectOptions::new(),
        };
        if let Some(timeout) = self.connect_timeout {
            connect_options = connect_options.connection_timeout(timeout);
        }
        if let Some(configured_host) = credentials.host {
            self.host = configured_host;
        }

        let nats_client = connect_options
            .connect(self.host.as_str())
            .await
            .map_err(Error::Connect)?;
        self.nats_client = Some(nats_client);
        Ok(self)
    }
}

/// Builder for configuring and creating NATS clients.
#[derive(Default)]
pub struct ClientBuilder {
    url: Option<String>,
    /// Optional path to NATS credentials file.
    credentials_path: Option<PathBuf>,
    connect_timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Creates a new instance of a client builder.
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Pass credentials file as path to the file.
    pub fn credentials_path(mut self, credentials_path: Option<PathBuf>) -> Self {
        self.credentials_path = credentials_path;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        Ok(Client {
            host: self
                .url
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_NATS_HOST.to_string()),
            credentials_path: self.credentials_path,
            connect_timeout: self.connect_timeout,
            nats_client: None,
        })
    }
}
