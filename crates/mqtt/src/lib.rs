//! MQTT ingress and egress for edgeflow pipelines.

pub mod client;
pub mod config;
pub mod sender;
pub mod trigger;
