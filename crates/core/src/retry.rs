//! Storage seam for payloads marked for retry.
//!
//! Senders mark failed payloads on the context. Whoever invoked the runtime
//! hands them to a [`RetryStore`] through [`surface`] once the chain is done.

use crate::context::{Context, RetryData};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Retry store is full, capacity {capacity}")]
    Full { capacity: usize },
    #[error("Retry store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A payload persisted for a later retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub id: String,
    pub correlation_id: String,
    /// Pipeline the payload failed in.
    pub pipeline: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl StoredObject {
    pub fn new(correlation_id: impl Into<String>, pipeline: impl Into<String>, data: RetryData) -> Self {
        StoredObject {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            pipeline: pipeline.into(),
            content_type: data.content_type,
            payload: data.payload,
            created_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait RetryStore: Debug + Send + Sync {
    async fn store(&self, object: StoredObject) -> Result<(), Error>;
}

/// Keeps stored objects in memory, optionally bounded.
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    objects: Mutex<Vec<StoredObject>>,
    capacity: Option<usize>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        MemoryRetryStore::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MemoryRetryStore {
            objects: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every stored object, oldest first.
    pub fn drain(&self) -> Vec<StoredObject> {
        self.objects
            .lock()
            .map(|mut objects| std::mem::take(&mut *objects))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RetryStore for MemoryRetryStore {
    async fn store(&self, object: StoredObject) -> Result<(), Error> {
        let mut objects = self.objects.lock().map_err(|_| Error::Poisoned)?;
        if let Some(capacity) = self.capacity {
            if objects.len() >= capacity {
                return Err(Error::Full { capacity });
            }
        }
        objects.push(object);
        Ok(())
    }
}

/// Moves retry data out of a finished context into `store`.
///
/// Returns whether an object was stored.
pub async fn surface(ctx: &mut Context, store: Option<&dyn RetryStore>) -> bool {
    let Some(data) = ctx.take_retry_data() else {
        return false;
    };
    let Some(store) = store else {
        warn!(
            correlation_id = %ctx.correlation_id(),
            size = data.payload.len(),
            "Retry data set but no retry store is configured; dropping"
        );
        return false;
    };

    let object = StoredObject::new(ctx.correlation_id(), ctx.resources().name.clone(), data);
    let id = object.id.clone();
    match store.store(object).await {
        Ok(()) => {
            info!(correlation_id = %ctx.correlation_id(), id = %id, "Stored payload for retry");
            true
        }
        Err(err) => {
            error!(correlation_id = %ctx.correlation_id(), "Failed to store payload for retry: {}", err);
            false
        }
    }
}
