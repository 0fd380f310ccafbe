//! Batch accumulator with count, time and combined flush policies.
//!
//! One accumulator serves every invocation routed through its pipeline slot.
//! Appending, the count check and the timer flush all run under the same
//! lock, so a buffered item is emitted by exactly one flush.

use crate::config::{self, parse_positive_duration};
use crate::context::Context;
use crate::envelope::CONTENT_TYPE_JSON;
use crate::function::{BoxError, Flow, PipelineFunction};
use crate::value::{self, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Batch threshold must be 1 or greater, got {0}")]
    InvalidThreshold(i64),
    #[error(transparent)]
    InvalidInterval(#[from] config::Error),
    #[error(transparent)]
    Value(#[from] value::Error),
}

/// Flush policy of an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    ByCount { threshold: usize },
    ByTime { interval: Duration },
    ByTimeAndCount { threshold: usize, interval: Duration },
}

impl BatchMode {
    pub fn by_count(threshold: i64) -> Result<Self, Error> {
        Ok(BatchMode::ByCount {
            threshold: validate_threshold(threshold)?,
        })
    }

    pub fn by_time(interval: &str) -> Result<Self, Error> {
        Ok(BatchMode::ByTime {
            interval: parse_positive_duration(interval)?,
        })
    }

    pub fn by_time_and_count(interval: &str, threshold: i64) -> Result<Self, Error> {
        Ok(BatchMode::ByTimeAndCount {
            threshold: validate_threshold(threshold)?,
            interval: parse_positive_duration(interval)?,
        })
    }

    fn threshold(&self) -> Option<usize> {
        match self {
            BatchMode::ByCount { threshold } | BatchMode::ByTimeAndCount { threshold, .. } => {
                Some(*threshold)
            }
            BatchMode::ByTime { .. } => None,
        }
    }

    fn interval(&self) -> Option<Duration> {
        match self {
            BatchMode::ByTime { interval } | BatchMode::ByTimeAndCount { interval, .. } => {
                Some(*interval)
            }
            BatchMode::ByCount { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            BatchMode::ByCount { threshold: 0 } | BatchMode::ByTimeAndCount { threshold: 0, .. } => {
                Err(Error::InvalidThreshold(0))
            }
            BatchMode::ByTime { interval } | BatchMode::ByTimeAndCount { interval, .. }
                if interval.is_zero() =>
            {
                Err(Error::InvalidInterval(config::Error::ZeroDuration(
                    format!("{interval:?}"),
                )))
            }
            _ => Ok(()),
        }
    }
}

fn validate_threshold(threshold: i64) -> Result<usize, Error> {
    match usize::try_from(threshold) {
        Ok(threshold) if threshold > 0 => Ok(threshold),
        _ => Err(Error::InvalidThreshold(threshold)),
    }
}

/// Receives batches flushed by the timer.
#[async_trait::async_trait]
pub trait FlushSink: Send + Sync {
    async fn flush(&self, batch: Value, count: usize);
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<Vec<Vec<u8>>>,
    reset: Notify,
}

impl Shared {
    async fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.buffer.lock().await)
    }
}

pub struct Batch {
    name: String,
    mode: BatchMode,
    shared: Arc<Shared>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Batch {
    /// Creates the accumulator and, for time based modes, starts its timer.
    ///
    /// Must be called from within a tokio runtime when the mode has an interval.
    pub fn new(
        name: impl Into<String>,
        mode: BatchMode,
        sink: Option<Arc<dyn FlushSink>>,
    ) -> Result<Self, Error> {
        mode.validate()?;
        let name = name.into();
        let shared = Arc::new(Shared::default());
        let timer = mode.interval().map(|interval| {
            tokio::spawn(run_timer(
                name.clone(),
                Arc::clone(&shared),
                interval,
                sink,
            ))
        });
        Ok(Batch {
            name,
            mode,
            shared,
            timer: std::sync::Mutex::new(timer),
        })
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// Number of items currently buffered.
    pub async fn len(&self) -> usize {
        self.shared.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn handle(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, Error> {
        let data = value::require(input)?.into_bytes()?;

        let flushed = {
            let mut buffer = self.shared.buffer.lock().await;
            buffer.push(data);
            trace!(
                correlation_id = %ctx.correlation_id(),
                batch = %self.name,
                buffered = buffer.len(),
                "Appended to batch"
            );
            match self.mode.threshold() {
                Some(threshold) if buffer.len() >= threshold => Some(std::mem::take(&mut *buffer)),
                _ => None,
            }
        };

        let Some(items) = flushed else {
            return Ok(Flow::Pending);
        };

        if self.mode.interval().is_some() {
            self.shared.reset.notify_one();
        }
        debug!(
            correlation_id = %ctx.correlation_id(),
            batch = %self.name,
            count = items.len(),
            "Batch threshold reached"
        );
        ctx.set_content_type(CONTENT_TYPE_JSON);
        Ok(Flow::Continue(join(items)))
    }

    fn stop_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

#[async_trait::async_trait]
impl PipelineFunction for Batch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut Context, input: Option<Value>) -> Result<Flow, BoxError> {
        self.handle(ctx, input).await.map_err(Into::into)
    }

    async fn shutdown(&self) {
        self.stop_timer();
    }
}

async fn run_timer(
    name: String,
    shared: Arc<Shared>,
    interval: Duration,
    sink: Option<Arc<dyn FlushSink>>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let items = shared.take().await;
                if items.is_empty() {
                    trace!(batch = %name, "Batch timer fired with empty buffer");
                    continue;
                }
                let count = items.len();
                match &sink {
                    Some(sink) => {
                        debug!(batch = %name, count, "Batch interval elapsed");
                        sink.flush(join(items), count).await;
                    }
                    None => warn!(batch = %name, count, "Batch flushed by timer has no sink; dropping"),
                }
            }
            _ = shared.reset.notified() => {
                trace!(batch = %name, "Batch timer reset");
            }
        }
    }
}

/// Joins buffered items into a JSON array, embedding items that parse as JSON.
fn join(items: Vec<Vec<u8>>) -> Value {
    Value::Json(serde_json::Value::Array(
        items
            .into_iter()
            .map(|item| {
                serde_json::from_slice(&item).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&item).into_owned())
                })
            })
            .collect(),
    ))
}
