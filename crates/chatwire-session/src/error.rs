//! Error types for the session layer.

/// Why an upgrade token was not accepted.
///
/// An `AuthError` stops the connection before it exists: the socket is
/// closed and nothing is registered with the hub.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token is unknown, malformed, or was rejected.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token was valid once but has expired.
    #[error("token expired")]
    Expired,
}
