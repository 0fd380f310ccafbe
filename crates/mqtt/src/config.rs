//! MQTT trigger and sender configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: &str = "30s";

/// How the client authenticates against the broker.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication (default).
    #[default]
    None,
    /// `username` and `password` secrets.
    UsernamePassword,
    /// `cacert` secret used as trusted root.
    CaCert,
    /// `clientcert` and `clientkey` secrets, with an optional `cacert`.
    ClientCert,
}

/// Broker connection settings shared by the trigger and the sender.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct Broker {
    /// Broker URL, for example `tcp://localhost:1883` or `ssl://broker:8883`.
    pub url: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Quality of service: 0, 1 or 2.
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    /// Keep polling the event loop after connection errors.
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Connect timeout as a duration string.
    pub connect_timeout: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Accept any server certificate.
    #[serde(default)]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Secret store path holding the credentials for `auth_mode`.
    pub secret_path: Option<String>,
}

impl Default for Broker {
    fn default() -> Self {
        Broker {
            url: String::new(),
            client_id: String::new(),
            qos: 0,
            retain: false,
            auto_reconnect: false,
            connect_timeout: None,
            keep_alive: DEFAULT_KEEP_ALIVE_SECS,
            skip_cert_verify: false,
            auth_mode: AuthMode::None,
            secret_path: None,
        }
    }
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

/// MQTT trigger configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub broker: Broker,
    /// Topic the trigger subscribes to.
    #[serde(default)]
    pub subscribe_topic: String,
    /// Topic the pipeline output is published to, if any.
    pub publish_topic: Option<String>,
}

/// MQTT sender configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Sender {
    #[serde(flatten)]
    pub broker: Broker,
    /// Topic the stage input is published to.
    pub topic: String,
    /// Mark failed payloads for retry.
    #[serde(default)]
    pub persist_on_error: bool,
    /// PEM client certificate file, used together with `key_file`.
    pub cert_file: Option<PathBuf>,
    /// PEM private key file for `cert_file`.
    pub key_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_deserialize() {
        let trigger: Trigger = serde_json::from_str(
            r#"{
                "url": "tcp://localhost:1883",
                "client_id": "edgeflow",
                "qos": 1,
                "auth_mode": "usernamepassword",
                "secret_path": "mqtt",
                "subscribe_topic": "events/#",
                "publish_topic": "processed"
            }"#,
        )
        .unwrap();
        assert_eq!(trigger.broker.qos, 1);
        assert_eq!(trigger.broker.keep_alive, DEFAULT_KEEP_ALIVE_SECS);
        assert_eq!(trigger.broker.auth_mode, AuthMode::UsernamePassword);
        assert_eq!(trigger.subscribe_topic, "events/#");
        assert_eq!(trigger.publish_topic.as_deref(), Some("processed"));
    }

    #[test]
    fn test_unknown_auth_mode_is_rejected() {
        let result: Result<Broker, _> = serde_json::from_str(
            r#"{"url": "tcp://localhost", "client_id": "c", "auth_mode": "kerberos"}"#,
        );
        assert!(result.is_err());
    }
}
