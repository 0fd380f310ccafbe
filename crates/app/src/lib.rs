//! Edge event pipeline service: one trigger feeding one configured pipeline.

pub mod config;
pub mod pipeline;
pub mod service;
