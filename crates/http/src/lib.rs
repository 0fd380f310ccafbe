//! HTTP egress for edgeflow pipelines.

pub mod config;
pub mod sender;
