use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default connect timeout, in Go duration syntax.
pub const DEFAULT_CONNECT_TIMEOUT: &str = "30s";

fn default_url() -> String {
    format!("nats://{}", crate::client::DEFAULT_NATS_HOST)
}

/// Message-bus trigger configuration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct Trigger {
    #[serde(default = "default_url")]
    pub url: String,
    /// JSON file with `nkey`, `user`/`password` or `token`, and an optional `host`.
    pub credentials_path: Option<PathBuf>,
    pub subscribe_topic: String,
    /// Subject that pipeline output and background envelopes are published to.
    pub publish_topic: Option<String>,
    pub connect_timeout: Option<String>,
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger {
            url: default_url(),
            credentials_path: None,
            subscribe_topic: String::new(),
            publish_topic: None,
            connect_timeout: None,
        }
    }
}
