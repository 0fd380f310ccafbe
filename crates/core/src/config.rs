//! Helpers for parsing configuration values.

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid duration {value:?}: {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("Invalid duration {0:?}: must be greater than zero")]
    ZeroDuration(String),
}

/// Parses a human readable duration such as `"300ms"`, `"30s"` or `"1h 30m"`.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    humantime::parse_duration(value.trim()).map_err(|source| Error::InvalidDuration {
        value: value.to_string(),
        source,
    })
}

/// Parses a duration that must be greater than zero.
pub fn parse_positive_duration(value: &str) -> Result<Duration, Error> {
    let duration = parse_duration(value)?;
    if duration.is_zero() {
        return Err(Error::ZeroDuration(value.to_string()));
    }
    Ok(duration)
}

/// Splits a comma separated list, trimming entries and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
