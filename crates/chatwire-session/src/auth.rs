//! Authentication hook for validating the caller's identity.
//!
//! chatwire does not issue or verify tokens itself; that belongs to the
//! identity service (JWT, session cookie, API key). The server calls the
//! [`Authenticator`] once per upgrade, right after the handshake.

use std::future::Future;

use chatwire_protocol::UserId;

use crate::AuthError;

/// Who is on the other end of a connection. Fixed for the connection's
/// whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            username: username.into(),
        }
    }
}

/// Validates an upgrade token and returns the caller's identity.
///
/// # Example
///
/// ```rust
/// use chatwire_session::{AuthError, Authenticator, Identity};
///
/// /// Accepts `user:<name>` tokens. Development only.
/// struct DevAuthenticator;
///
/// impl Authenticator for DevAuthenticator {
///     async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
///         let name = token
///             .strip_prefix("user:")
///             .ok_or_else(|| AuthError::InvalidToken("expected user:<name>".into()))?;
///         Ok(Identity::new(name, name))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the given token.
    ///
    /// # Returns
    /// - `Ok(Identity)`: the token is good, here's who they are
    /// - `Err(AuthError)`: reject the connection
    fn authenticate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Identity, AuthError>> + Send;
}
