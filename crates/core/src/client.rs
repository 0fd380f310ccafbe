//! Connection step shared by message-bus clients.
//!
//! Clients are built from configuration without touching the network. A
//! trigger calls [`Client::connect`] from its `initialize`, under its own
//! connect timeout, and keeps the connected value for its subscription and
//! output publishing. The NATS client in `edgeflow_nats` implements it.

/// A configured client that consumes itself to produce its connected form.
pub trait Client {
    type Error;

    /// Opens the connection, failing on unreachable servers or bad credentials.
    fn connect(self) -> impl std::future::Future<Output = Result<Self, Self::Error>> + Send
    where
        Self: Sized;
}
