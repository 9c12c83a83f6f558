//! In-process collaborators.
//!
//! Enough to run the demo server and to drive the dispatcher in tests;
//! nothing here survives a restart. Stored messages and audit records
//! are capped so a long-running demo keeps bounded memory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chatwire_protocol::{ChannelId, MessageId, UserId};
use chatwire_session::{AuthError, Authenticator, Identity};
use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;

use crate::services::{
    AuditEvent, AuditLog, AuditMetadata, ChannelAccess, MessageStore, PersistedMessage,
    ServiceError,
};

// =========================================================================
// Identity
// =========================================================================

/// Accepts a fixed set of tokens.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token that authenticates as the given user.
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        self.tokens
            .insert(token.into(), Identity::new(user_id, username));
        self
    }
}

impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

// =========================================================================
// Channels
// =========================================================================

#[derive(Debug, Default)]
struct ChannelRecord {
    members: HashSet<UserId>,
    banned: HashSet<UserId>,
}

/// Channel membership and bans.
#[derive(Debug, Default)]
pub struct InMemoryChannels {
    channels: RwLock<HashMap<ChannelId, ChannelRecord>>,
}

impl InMemoryChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel if it does not exist yet.
    pub async fn create(&self, channel_id: impl Into<ChannelId>) {
        self.channels
            .write()
            .await
            .entry(channel_id.into())
            .or_default();
    }

    pub async fn add_member(
        &self,
        channel_id: &ChannelId,
        user_id: impl Into<UserId>,
    ) -> Result<(), ServiceError> {
        let mut channels = self.channels.write().await;
        let record = channels
            .get_mut(channel_id)
            .ok_or_else(|| ServiceError::NotFound(channel_id.to_string()))?;
        record.members.insert(user_id.into());
        Ok(())
    }

    pub async fn ban(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<(), ServiceError> {
        let mut channels = self.channels.write().await;
        let record = channels
            .get_mut(channel_id)
            .ok_or_else(|| ServiceError::NotFound(channel_id.to_string()))?;
        record.banned.insert(user_id.clone());
        Ok(())
    }

    pub async fn unban(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<(), ServiceError> {
        let mut channels = self.channels.write().await;
        let record = channels
            .get_mut(channel_id)
            .ok_or_else(|| ServiceError::NotFound(channel_id.to_string()))?;
        record.banned.remove(user_id);
        Ok(())
    }
}

impl ChannelAccess for InMemoryChannels {
    async fn can_access(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<bool, ServiceError> {
        let channels = self.channels.read().await;
        let record = channels
            .get(channel_id)
            .ok_or_else(|| ServiceError::NotFound(channel_id.to_string()))?;
        Ok(record.members.contains(user_id) && !record.banned.contains(user_id))
    }

    async fn exists(&self, channel_id: &ChannelId) -> Result<bool, ServiceError> {
        Ok(self.channels.read().await.contains_key(channel_id))
    }
}

// =========================================================================
// Messages
// =========================================================================

/// How many messages or audit records are kept before the oldest are
/// dropped.
pub const DEFAULT_RETAINED: usize = 1024;

/// Keeps the most recent messages in memory and assigns random hex ids.
#[derive(Debug)]
pub struct InMemoryMessages {
    messages: RwLock<VecDeque<PersistedMessage>>,
    retained: usize,
}

impl Default for InMemoryMessages {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }
}

impl InMemoryMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `retained` messages across all channels.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::new()),
            retained,
        }
    }

    /// Retained messages for a channel, oldest first.
    pub async fn history(&self, channel_id: &ChannelId) -> Vec<PersistedMessage> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| &m.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.messages.read().await.len()
    }
}

impl MessageStore for InMemoryMessages {
    async fn create(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<PersistedMessage, ServiceError> {
        let message = PersistedMessage {
            id: MessageId(generate_id()),
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        push_bounded(&mut *self.messages.write().await, message.clone(), self.retained);
        Ok(message)
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, retained: usize) {
    if retained == 0 {
        return;
    }
    while buf.len() >= retained {
        buf.pop_front();
    }
    buf.push_back(item);
}

/// 128 random bits as 32 lowercase hex characters.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Audit
// =========================================================================

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub actor: UserId,
    pub channel_id: ChannelId,
    pub metadata: AuditMetadata,
}

/// Emits audit events as `tracing` records and keeps a copy of the most
/// recent ones.
#[derive(Debug)]
pub struct TracingAudit {
    records: Mutex<VecDeque<AuditRecord>>,
    retained: usize,
}

impl Default for TracingAudit {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }
}

impl TracingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `retained` records; `0` only emits to `tracing`.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retained,
        }
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl AuditLog for TracingAudit {
    async fn log(
        &self,
        event: AuditEvent,
        actor: &UserId,
        channel_id: &ChannelId,
        metadata: AuditMetadata,
    ) -> Result<(), ServiceError> {
        tracing::info!(target: "chatwire::audit", %event, %actor, %channel_id, ?metadata, "audit");
        let mut records = self
            .records
            .lock()
            .map_err(|_| ServiceError::Backend("audit log poisoned".into()))?;
        let record = AuditRecord {
            event,
            actor: actor.clone(),
            channel_id: channel_id.clone(),
            metadata,
        };
        push_bounded(&mut *records, record, self.retained);
        Ok(())
    }
}
