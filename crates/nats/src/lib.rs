//! NATS message-bus ingress and background publishing for edgeflow pipelines.

pub mod client;
pub mod config;
pub mod trigger;
