//! Session identity and lifecycle for chatwire.
//!
//! 1. **Authentication**: turning an upgrade token into an [`Identity`]
//!    ([`Authenticator`] trait, implemented by the identity service).
//! 2. **Lifecycle**: the [`ConnectionState`] machine every connection
//!    walks through, and the [`CloseReason`] that ends it.
//!
//! ```text
//! Hub layer (above)       ← registers Authenticated connections
//!     ↕
//! Session layer (this)    ← who the caller is, where the connection is
//!     ↕
//! Protocol layer (below)  ← UserId
//! ```

mod auth;
mod error;
mod state;

pub use auth::{Authenticator, Identity};
pub use error::AuthError;
pub use state::{CloseReason, ConnectionState};
