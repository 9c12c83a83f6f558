//! Transport layer for chatwire.
//!
//! A connection is split into two halves that are driven by separate
//! tasks: a [`FrameStream`] the inbound loop reads from and a
//! [`FrameSink`] the outbound loop writes to. The traits keep the hub
//! and its connection loops independent of the socket type, so tests
//! can plug in in-memory halves.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket upgrade via `tokio-tungstenite`

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{
    PendingUpgrade, UpgradeConfig, Upgraded, WebSocketFrames, WebSocketSink,
    WebSocketTransport, extract_token,
};

use std::fmt;
use std::future::Future;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One item read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A data frame (text or binary) carrying an encoded envelope.
    Data(Vec<u8>),
    /// A control frame (ping or pong). Carries no envelope but proves
    /// the peer is alive.
    Heartbeat,
}

/// The write half of a connection.
pub trait FrameSink: Send + 'static {
    /// Writes one encoded frame to the peer.
    fn send(
        &mut self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends a close frame with the given code and reason, then shuts
    /// the write half down.
    fn close(
        &mut self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// The read half of a connection.
pub trait FrameStream: Send + 'static {
    /// Waits for the next frame from the peer.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Result<Option<Inbound>, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_orders_by_value() {
        let mut ids = vec![ConnectionId::new(3), ConnectionId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![ConnectionId::new(1), ConnectionId::new(3)]);
    }
}
