//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding envelopes.
///
/// A decode failure is a client mistake: the dispatcher answers it with a
/// `PARSE_ERROR` envelope and keeps the connection open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, unknown `type`, or a
    /// `data` object of the wrong shape.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}
