//! Collaborators the dispatcher calls for side effects.
//!
//! Channel authorization, message persistence and audit logging live in
//! the surrounding application (usually backed by a database). chatwire
//! only needs these three narrow traits; [`crate::memory`] has in-process
//! implementations for tests and the demo server.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use chatwire_protocol::{ChannelId, MessageId, UserId};
use chrono::{DateTime, Utc};

/// Errors reported by a collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The channel (or other addressed record) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A chat message after the store has accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Decides whether a user may use a channel.
pub trait ChannelAccess: Send + Sync + 'static {
    /// `Ok(true)` if the user is a member and not banned, `Ok(false)` if
    /// not, [`ServiceError::NotFound`] if the channel does not exist.
    fn can_access(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<bool, ServiceError>> + Send;

    /// Whether the channel exists at all, regardless of who asks.
    fn exists(
        &self,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<bool, ServiceError>> + Send;
}

/// Persists chat messages and assigns their canonical id and timestamp.
pub trait MessageStore: Send + Sync + 'static {
    fn create(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
        content: &str,
    ) -> impl Future<Output = Result<PersistedMessage, ServiceError>> + Send;
}

/// What happened, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    ChannelJoined,
    ChannelLeft,
    MessageSent,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelJoined => "channel.joined",
            Self::ChannelLeft => "channel.left",
            Self::MessageSent => "message.sent",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form key/value details attached to an audit event.
pub type AuditMetadata = BTreeMap<String, String>;

/// Records user actions. Failures are logged by the caller and never
/// fail the action itself.
pub trait AuditLog: Send + Sync + 'static {
    fn log(
        &self,
        event: AuditEvent,
        actor: &UserId,
        channel_id: &ChannelId,
        metadata: AuditMetadata,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}
