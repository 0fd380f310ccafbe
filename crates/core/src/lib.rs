//! Pipeline engine shared by every edgeflow transport crate.
//!
//! Holds the envelope and value types, the per-invocation context, the
//! function contract and runtime, and the collaborators a pipeline needs
//! at run time: batching, background publishing, retry marking and secrets.

pub mod batch;
pub mod client;
pub mod config;
pub mod context;
pub mod continuation;
pub mod envelope;
pub mod event;
pub mod function;
pub mod publisher;
pub mod retry;
pub mod runtime;
pub mod secret;
pub mod trigger;
pub mod value;
pub mod transforms {
    pub mod compression;
    pub mod conversion;
    pub mod encryption;
    pub mod filter;
    pub mod logic;
    pub mod output;
    pub mod tags;
}
