//! # chatwire
//!
//! Real-time chat relay over WebSocket.
//!
//! Clients upgrade on a single path with a previously issued token, join
//! channels, and exchange chat messages, presence and typing signals as
//! JSON [`Envelope`](chatwire_protocol::Envelope)s. The server persists
//! chat messages through a [`MessageStore`], checks channel access
//! through [`ChannelAccess`], and fans every event out to the channel's
//! live members.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatwire::prelude::*;
//!
//! # async fn run() -> Result<(), ChatwireError> {
//! let channels = InMemoryChannels::new();
//! channels.create("general").await;
//! channels.add_member(&ChannelId::from("general"), "u-1").await.ok();
//!
//! let server = ChatwireServer::builder()
//!     .bind("127.0.0.1:8080")
//!     .build(
//!         StaticTokens::new().with_token("t-1", "u-1", "alice"),
//!         channels,
//!         InMemoryMessages::new(),
//!         TracingAudit::new(),
//!     )
//!     .await?;
//! server.run().await
//! # }
//! ```

mod dispatcher;
mod error;
mod handler;
pub mod logger;
pub mod memory;
mod server;
pub mod services;

pub use dispatcher::{DispatchConfig, DispatchError, Dispatcher};
pub use error::ChatwireError;
pub use server::{ChatwireServer, ChatwireServerBuilder, ServerHandle};

pub use chatwire_hub as hub;
pub use chatwire_protocol as protocol;
pub use chatwire_session as session;
pub use chatwire_transport as transport;

/// Everything needed to stand up a server.
pub mod prelude {
    pub use crate::memory::{InMemoryChannels, InMemoryMessages, StaticTokens, TracingAudit};
    pub use crate::services::{
        AuditEvent, AuditLog, AuditMetadata, ChannelAccess, MessageStore, PersistedMessage,
        ServiceError,
    };
    pub use crate::{
        ChatwireError, ChatwireServer, ChatwireServerBuilder, DispatchConfig, Dispatcher,
        ServerHandle,
    };
    pub use chatwire_hub::{ConnectionConfig, Hub, HubStats};
    pub use chatwire_protocol::{ChannelId, Envelope, ErrorCode, MessageId, Payload, UserId};
    pub use chatwire_session::{AuthError, Authenticator, CloseReason, Identity};
}
