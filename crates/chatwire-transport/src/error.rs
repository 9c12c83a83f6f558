/// Errors that can occur in the transport layer.
///
/// Every variant is fatal for the connection it came from: the layers
/// above turn any of these into a close of that one connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed (includes oversized frames).
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting TCP connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The HTTP upgrade was refused or could not be completed.
    #[error("upgrade rejected: {0}")]
    UpgradeRejected(String),
}
