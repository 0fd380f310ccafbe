//! Secret lookup seam and a file-backed provider.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to read secrets file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse secrets file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Secret {key} not found at path {path}")]
    SecretNotFound { path: String, key: String },
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Source of named secrets grouped under a path.
#[async_trait::async_trait]
pub trait SecretProvider: Debug + Send + Sync {
    /// Returns the requested keys stored at `path`. An empty key list returns every secret.
    async fn get_secrets(&self, path: &str, keys: &[&str]) -> Result<HashMap<String, String>, Error>;
}

/// Reads secrets from `<root>/<path>.json`, each file a flat object of strings.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    root: PathBuf,
}

impl FileSecretProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSecretProvider { root: root.into() }
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", path.trim_start_matches('/')))
    }
}

#[async_trait::async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_secrets(&self, path: &str, keys: &[&str]) -> Result<HashMap<String, String>, Error> {
        let file_path = self.file_path(path);
        let contents = tokio::fs::read_to_string(&file_path)
            .await
            .map_err(|source| Error::ReadFile {
                path: file_path.clone(),
                source,
            })?;
        let mut secrets: HashMap<String, String> =
            serde_json::from_str(&contents).map_err(|source| Error::ParseFile {
                path: file_path,
                source,
            })?;

        if keys.is_empty() {
            return Ok(secrets);
        }

        keys.iter()
            .map(|key| {
                secrets
                    .remove_entry(*key)
                    .ok_or_else(|| Error::SecretNotFound {
                        path: path.to_string(),
                        key: key.to_string(),
                    })
            })
            .collect()
    }
}
