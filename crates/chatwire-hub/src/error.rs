//! Error types for the hub layer.

use chatwire_protocol::ProtocolError;

/// Errors returned by [`Hub`](crate::Hub) operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub has been torn down; nothing may register any more.
    #[error("hub is shut down")]
    ShutDown,

    /// An outbound envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why a frame could not be put on a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The connection is closing or closed.
    #[error("connection is closed")]
    Closed,

    /// The queue was full; the connection has been closed as a slow
    /// consumer.
    #[error("outbound queue full")]
    SlowConsumer,
}
