//! Secure MQTT client factory.
//!
//! Turns a broker configuration into `rumqttc` options: scheme and port from
//! the URL, TLS through `rustls`, and credentials or certificates read
//! from the secret store according to the auth mode.

use crate::config::{AuthMode, Broker};
use edgeflow_core::config::parse_positive_duration;
use edgeflow_core::secret::{self, SecretProvider};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default port for plain MQTT.
pub const DEFAULT_PORT: u16 = 1883;
/// Default port for MQTT over TLS.
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Capacity of the request channel between client and event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

const USERNAME: &str = "username";
const PASSWORD: &str = "password";
const CA_CERT: &str = "cacert";
const CLIENT_CERT: &str = "clientcert";
const CLIENT_KEY: &str = "clientkey";

/// Errors that can occur while creating or connecting an MQTT client.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid broker URL {url}: {source}")]
    ParseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Broker URL {0} has no host")]
    MissingHost(String),
    #[error("Unsupported broker URL scheme {0}")]
    UnsupportedScheme(String),
    #[error("Invalid QoS {0}, must be 0, 1 or 2")]
    InvalidQos(u8),
    #[error(transparent)]
    InvalidTimeout(#[from] edgeflow_core::config::Error),
    #[error("Auth mode {0:?} requires a secret path")]
    MissingSecretPath(AuthMode),
    #[error("Auth mode {0:?} requires a secret provider")]
    NoSecretProvider(AuthMode),
    #[error(transparent)]
    Secret(#[from] secret::Error),
    #[error("Failed to read certificate file at {path} with error: {source}")]
    ReadCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS setup failed with error: {source}")]
    Tls {
        #[source]
        source: rustls::Error,
    },
    #[error("Failed to parse PEM data with error: {source}")]
    Pem {
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {0} PEM data")]
    NoCertificate(&'static str),
    #[error("No private key found in client key PEM data")]
    MissingPrivateKey,
    #[error("Connection to broker failed with error: {source}")]
    Connection {
        #[source]
        source: rumqttc::ConnectionError,
    },
    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("Timed out connecting to broker {0}")]
    ConnectTimeout(String),
    #[error("Client ID must not be empty")]
    EmptyClientId,
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// PEM client certificate and key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCertPair").finish_non_exhaustive()
    }
}

impl KeyCertPair {
    /// Reads a PEM certificate and key from disk.
    pub async fn from_files(cert_file: &PathBuf, key_file: &PathBuf) -> Result<Self, Error> {
        let read = |path: &PathBuf| {
            let path = path.clone();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| Error::ReadCertificate { path, source })
            }
        };
        Ok(KeyCertPair {
            cert: read(cert_file).await?,
            key: read(key_file).await?,
        })
    }
}

/// Converts a configured QoS level.
pub fn qos(level: u8) -> Result<QoS, Error> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidQos(other)),
    }
}

/// Parses the configured connect timeout, falling back to the default.
pub fn connect_timeout(broker: &Broker) -> Result<Duration, Error> {
    let value = broker
        .connect_timeout
        .as_deref()
        .unwrap_or(crate::config::DEFAULT_CONNECT_TIMEOUT);
    Ok(parse_positive_duration(value)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

fn endpoint(url: &str) -> Result<Endpoint, Error> {
    let parsed = url::Url::parse(url).map_err(|source| Error::ParseUrl {
        url: url.to_string(),
        source,
    })?;
    let tls = match parsed.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::MissingHost(url.to_string()))?
        .to_string();
    let port = parsed
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
    Ok(Endpoint { host, port, tls })
}

/// Credentials resolved from the secret store.
#[derive(Default)]
struct AuthSecrets {
    username: Option<(String, String)>,
    ca_cert: Option<Vec<u8>>,
    client: Option<KeyCertPair>,
}

/// Builds ready-to-connect MQTT clients.
#[derive(Debug, Clone)]
pub struct SecureMqttFactory {
    broker: Arc<Broker>,
    secrets: Option<Arc<dyn SecretProvider>>,
    key_pair: Option<KeyCertPair>,
}

impl SecureMqttFactory {
    /// Resolves secrets and returns the options the client connects with.
    pub async fn options(&self) -> Result<MqttOptions, Error> {
        if self.broker.client_id.is_empty() {
            return Err(Error::EmptyClientId);
        }
        let endpoint = endpoint(&self.broker.url)?;
        let auth = self.auth_secrets().await?;

        let mut options = MqttOptions::new(&self.broker.client_id, &endpoint.host, endpoint.port);
        options
            .set_keep_alive(Duration::from_secs(self.broker.keep_alive))
            .set_clean_session(true);
        if let Some((username, password)) = auth.username {
            options.set_credentials(username, password);
        }

        if endpoint.tls {
            let client_pair = auth.client.or_else(|| self.key_pair.clone());
            let config = tls_config(
                auth.ca_cert.as_deref(),
                client_pair.as_ref(),
                self.broker.skip_cert_verify,
            )?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(config)));
        }

        debug!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            auth_mode = ?self.broker.auth_mode,
            "Created MQTT client options"
        );
        Ok(options)
    }

    /// Creates a client and its event loop. Nothing is sent until the loop is polled.
    pub async fn create(&self) -> Result<(AsyncClient, EventLoop), Error> {
        let options = self.options().await?;
        Ok(AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Creates a client and polls its event loop until the broker acknowledges the connection.
    pub async fn connect(&self) -> Result<(AsyncClient, EventLoop), Error> {
        let timeout = connect_timeout(&self.broker)?;
        let (client, mut eventloop) = self.create().await?;
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| Error::ConnectTimeout(self.broker.url.clone()))??;
        Ok((client, eventloop))
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    async fn auth_secrets(&self) -> Result<AuthSecrets, Error> {
        let mode = self.broker.auth_mode;
        let keys: &[&str] = match mode {
            AuthMode::None => return Ok(AuthSecrets::default()),
            AuthMode::UsernamePassword => &[USERNAME, PASSWORD],
            AuthMode::CaCert => &[CA_CERT],
            AuthMode::ClientCert => &[CLIENT_CERT, CLIENT_KEY],
        };
        let path = self
            .broker
            .secret_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .ok_or(Error::MissingSecretPath(mode))?;
        let provider = self.secrets.as_ref().ok_or(Error::NoSecretProvider(mode))?;

        let mut secrets = provider.get_secrets(path, keys).await?;
        let mut take = |key: &str| {
            secrets.remove(key).ok_or_else(|| secret::Error::SecretNotFound {
                path: path.to_string(),
                key: key.to_string(),
            })
        };

        let auth = match mode {
            AuthMode::None => AuthSecrets::default(),
            AuthMode::UsernamePassword => AuthSecrets {
                username: Some((take(USERNAME)?, take(PASSWORD)?)),
                ..Default::default()
            },
            AuthMode::CaCert => AuthSecrets {
                ca_cert: Some(take(CA_CERT)?.into_bytes()),
                ..Default::default()
            },
            AuthMode::ClientCert => {
                let client = KeyCertPair {
                    cert: take(CLIENT_CERT)?.into_bytes(),
                    key: take(CLIENT_KEY)?.into_bytes(),
                };
                // The CA certificate is optional in client certificate mode.
                let ca_cert = provider
                    .get_secrets(path, &[CA_CERT])
                    .await
                    .ok()
                    .and_then(|mut ca| ca.remove(CA_CERT))
                    .map(String::into_bytes);
                AuthSecrets {
                    ca_cert,
                    client: Some(client),
                    ..Default::default()
                }
            }
        };
        Ok(auth)
    }
}

/// Accepts any server certificate, for brokers with self-signed certificates.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn pem_certificates(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::Pem { source })?;
    if certs.is_empty() {
        return Err(Error::NoCertificate(what));
    }
    Ok(certs)
}

/// Trusts the PEM `ca_cert` when given, the platform roots otherwise.
fn root_store(ca_cert: Option<&[u8]>) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    match ca_cert {
        Some(pem) => {
            for cert in pem_certificates(pem, CA_CERT)? {
                roots.add(cert).map_err(|source| Error::Tls { source })?;
            }
        }
        None => match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!(added, ignored, "Loaded platform root certificates");
            }
            Err(err) => warn!("Failed to load platform root certificates: {}", err),
        },
    }
    Ok(roots)
}

/// Builds the rustls client configuration for a TLS broker connection.
fn tls_config(
    ca_cert: Option<&[u8]>,
    client: Option<&KeyCertPair>,
    skip_cert_verify: bool,
) -> Result<Arc<ClientConfig>, Error> {
    let builder = if skip_cert_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    } else {
        ClientConfig::builder().with_root_certificates(root_store(ca_cert)?)
    };
    let config = match client {
        Some(pair) => {
            let certs = pem_certificates(&pair.cert, CLIENT_CERT)?;
            let key = rustls_pemfile::private_key(&mut pair.key.as_slice())
                .map_err(|source| Error::Pem { source })?
                .ok_or(Error::MissingPrivateKey)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|source| Error::Tls { source })?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Polls the event loop until a `ConnAck` arrives.
pub async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), Error> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                return match code {
                    ConnectReturnCode::Success => Ok(()),
                    refused => Err(Error::Refused(refused)),
                };
            }
            Ok(_) => {}
            Err(source) => return Err(Error::Connection { source }),
        }
    }
}

/// Builder for the secure MQTT factory.
#[derive(Default)]
pub struct SecureMqttFactoryBuilder {
    broker: Option<Arc<Broker>>,
    secrets: Option<Arc<dyn SecretProvider>>,
    key_pair: Option<KeyCertPair>,
}

impl SecureMqttFactoryBuilder {
    pub fn new() -> SecureMqttFactoryBuilder {
        SecureMqttFactoryBuilder {
            ..Default::default()
        }
    }

    pub fn broker(mut self, broker: Arc<Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn secrets(mut self, secrets: Option<Arc<dyn SecretProvider>>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Client certificate used when the auth mode does not provide one.
    pub fn key_pair(mut self, key_pair: KeyCertPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn build(self) -> Result<SecureMqttFactory, Error> {
        let broker = self
            .broker
            .ok_or_else(|| Error::MissingRequiredAttribute("broker".to_string()))?;
        qos(broker.qos)?;
        connect_timeout(&broker)?;
        endpoint(&broker.url)?;
        Ok(SecureMqttFactory {
            broker,
            secrets: self.secrets,
            key_pair: self.key_pair,
        })
    }
}
