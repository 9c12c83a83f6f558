//! Unified error type for the chatwire server.

use chatwire_hub::HubError;
use chatwire_protocol::ProtocolError;
use chatwire_session::AuthError;
use chatwire_transport::TransportError;

/// Top-level error wrapping every layer's error type, so `?` works
/// across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum ChatwireError {
    /// Binding, accepting, upgrading, or a socket fault.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The upgrade token was rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The hub refused the connection (shut down).
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The upgrade and authentication did not finish before the
    /// handshake deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
}
