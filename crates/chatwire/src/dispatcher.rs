//! Inbound message routing.
//!
//! Every data frame a connection reads ends up in
//! [`Dispatcher::dispatch`]: it is decoded, validated, checked against
//! the channel collaborators, and turned into broadcasts and direct
//! replies through the hub. A rejected frame is answered with an `error`
//! envelope; it never closes the connection.

use std::sync::Arc;

use chatwire_hub::{Connection, Hub, HubError, InboundHandler};
use chatwire_protocol::{
    ChannelId, ChatData, Codec, Envelope, ErrorCode, JsonCodec, Payload, PresenceData,
    TypingData, UserId,
};

use crate::services::{
    AuditEvent, AuditLog, AuditMetadata, ChannelAccess, MessageStore, ServiceError,
};

/// Limits applied to client submissions.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Longest accepted chat message, in characters.
    pub max_content_chars: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 2000,
        }
    }
}

/// Why a frame was rejected. Each variant maps to one stable
/// [`ErrorCode`] sent back to the client.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed JSON, unknown type tag, or a type clients may not send.
    #[error("malformed message: {0}")]
    Parse(String),

    /// Well-formed but unacceptable (blank channel, bad content).
    #[error("{0}")]
    Invalid(String),

    #[error("not a member of channel {0}")]
    NotInChannel(ChannelId),

    #[error("access to channel {0} denied")]
    Forbidden(ChannelId),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    /// A collaborator failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::Invalid(_) => ErrorCode::InvalidMessage,
            Self::NotInChannel(_) => ErrorCode::NotInChannel,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::ChannelNotFound(_) | Self::Service(ServiceError::NotFound(_)) => {
                ErrorCode::ChannelNotFound
            }
            Self::Service(ServiceError::Backend(_)) | Self::Hub(_) => ErrorCode::InternalError,
        }
    }

    /// The text sent to the client. Backend details stay in the logs.
    fn client_message(&self) -> String {
        match self.code() {
            ErrorCode::InternalError => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Routes inbound envelopes. One instance serves every connection.
pub struct Dispatcher<A, M, L, C: Codec = JsonCodec> {
    hub: Arc<Hub<C>>,
    channels: A,
    messages: M,
    audit: L,
    config: DispatchConfig,
}

impl<A, M, L, C> Dispatcher<A, M, L, C>
where
    A: ChannelAccess,
    M: MessageStore,
    L: AuditLog,
    C: Codec,
{
    pub fn new(hub: Arc<Hub<C>>, channels: A, messages: M, audit: L) -> Self {
        Self {
            hub,
            channels,
            messages,
            audit,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hub(&self) -> &Arc<Hub<C>> {
        &self.hub
    }

    pub fn channels(&self) -> &A {
        &self.channels
    }

    pub fn messages(&self) -> &M {
        &self.messages
    }

    pub fn audit(&self) -> &L {
        &self.audit
    }

    /// Handles one inbound frame from `conn`.
    pub async fn dispatch(&self, conn: &Arc<Connection>, data: &[u8]) {
        let result = match self.hub.codec().decode::<Envelope>(data) {
            Ok(envelope) => self.route(conn, envelope).await,
            Err(e) => Err(DispatchError::Parse(e.to_string())),
        };

        if let Err(e) = result {
            match e.code() {
                ErrorCode::InternalError => {
                    tracing::error!(conn_id = %conn.id(), error = %e, "dispatch failed");
                }
                code => {
                    tracing::debug!(conn_id = %conn.id(), %code, error = %e, "rejected frame");
                }
            }
            self.reply(conn, Envelope::error(e.code(), e.client_message()))
                .await;
        }
    }

    async fn route(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<(), DispatchError> {
        let kind = envelope.kind();
        tracing::debug!(conn_id = %conn.id(), kind, "routing");
        match envelope.payload {
            Payload::Chat(data) => self.handle_chat(conn, data).await,
            Payload::Join(data) => self.handle_join(conn, data.channel_id).await,
            Payload::Leave(data) => self.handle_leave(conn, data.channel_id).await,
            Payload::Typing(data) => self.handle_typing(conn, data).await,
            Payload::Ping => {
                self.reply(conn, Envelope::pong()).await;
                Ok(())
            }
            // Liveness only; the read already refreshed last_seen.
            Payload::Pong => Ok(()),
            Payload::Error(_) | Payload::Ack(_) => Err(DispatchError::Parse(format!(
                "clients may not send '{kind}' messages"
            ))),
        }
    }

    async fn handle_chat(&self, conn: &Arc<Connection>, data: ChatData) -> Result<(), DispatchError> {
        let channel_id = require_channel(data.channel_id)?;
        let content = data.content;
        if content.trim().is_empty() {
            return Err(DispatchError::Invalid("content must not be empty".into()));
        }
        if content.chars().count() > self.config.max_content_chars {
            return Err(DispatchError::Invalid(format!(
                "content exceeds {} characters",
                self.config.max_content_chars
            )));
        }
        if !self.hub.is_member(conn.id(), &channel_id).await {
            return Err(DispatchError::NotInChannel(channel_id));
        }
        self.authorize(conn.user_id(), &channel_id).await?;

        let message = self
            .messages
            .create(conn.user_id(), &channel_id, &content)
            .await?;

        let envelope = Envelope::chat(ChatData {
            message_id: Some(message.id.clone()),
            channel_id: channel_id.clone(),
            sender_id: Some(message.user_id.clone()),
            sender_name: Some(conn.username().to_string()),
            content: message.content,
            created_at: Some(message.created_at),
            nonce: None,
        });
        let delivered = self
            .hub
            .broadcast_to_channel(&channel_id, &envelope, None)
            .await?;
        tracing::debug!(conn_id = %conn.id(), %channel_id, message_id = %message.id, delivered, "chat message sent");

        let metadata = AuditMetadata::from([("message_id".to_string(), message.id.to_string())]);
        self.record(AuditEvent::MessageSent, conn.user_id(), &channel_id, metadata)
            .await;

        if data.nonce.is_some() {
            self.reply(conn, Envelope::ack(message.id, data.nonce)).await;
        }
        Ok(())
    }

    async fn handle_join(&self, conn: &Arc<Connection>, channel_id: ChannelId) -> Result<(), DispatchError> {
        let channel_id = require_channel(channel_id)?;
        self.authorize(conn.user_id(), &channel_id).await?;

        let presence = Envelope::stamped(Payload::Join(presence(conn, &channel_id)));
        if self.hub.join_channel(conn.id(), &channel_id).await {
            self.hub
                .broadcast_to_channel(&channel_id, &presence, Some(conn.id()))
                .await?;
            self.record(
                AuditEvent::ChannelJoined,
                conn.user_id(),
                &channel_id,
                AuditMetadata::new(),
            )
            .await;
        }
        self.reply(conn, presence).await;
        Ok(())
    }

    async fn handle_leave(&self, conn: &Arc<Connection>, channel_id: ChannelId) -> Result<(), DispatchError> {
        let channel_id = require_channel(channel_id)?;
        if !self.channels.exists(&channel_id).await? {
            self.hub.leave_channel(conn.id(), &channel_id).await;
            return Err(DispatchError::ChannelNotFound(channel_id));
        }

        let presence = Envelope::stamped(Payload::Leave(presence(conn, &channel_id)));
        if self.hub.leave_channel(conn.id(), &channel_id).await {
            self.hub
                .broadcast_to_channel(&channel_id, &presence, Some(conn.id()))
                .await?;
            self.record(
                AuditEvent::ChannelLeft,
                conn.user_id(),
                &channel_id,
                AuditMetadata::new(),
            )
            .await;
        }
        self.reply(conn, presence).await;
        Ok(())
    }

    async fn handle_typing(&self, conn: &Arc<Connection>, data: TypingData) -> Result<(), DispatchError> {
        let channel_id = require_channel(data.channel_id)?;
        if !self.hub.is_member(conn.id(), &channel_id).await {
            return Err(DispatchError::NotInChannel(channel_id));
        }
        let envelope = Envelope::stamped(Payload::Typing(TypingData {
            channel_id: channel_id.clone(),
            user_id: Some(conn.user_id().clone()),
            username: Some(conn.username().to_string()),
            is_typing: data.is_typing,
        }));
        self.hub
            .broadcast_to_channel(&channel_id, &envelope, Some(conn.id()))
            .await?;
        Ok(())
    }

    /// Takes a user's live connection out of a channel, e.g. right after
    /// they were banned from it, and tells the remaining members.
    ///
    /// Returns `false` if the user had no live connection in the channel.
    pub async fn evict_from_channel(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<bool, DispatchError> {
        let Some(conn) = self.hub.find_by_user(user_id).await else {
            return Ok(false);
        };
        if !self.hub.remove_user_from_channel(user_id, channel_id).await {
            return Ok(false);
        }
        let presence = Envelope::stamped(Payload::Leave(presence(&conn, channel_id)));
        self.hub
            .broadcast_to_channel(channel_id, &presence, None)
            .await?;
        self.reply(&conn, presence).await;
        tracing::info!(%user_id, %channel_id, "evicted from channel");
        Ok(true)
    }

    async fn authorize(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<(), DispatchError> {
        match self.channels.can_access(user_id, channel_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DispatchError::Forbidden(channel_id.clone())),
            Err(ServiceError::NotFound(_)) => Err(DispatchError::ChannelNotFound(channel_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn reply(&self, conn: &Arc<Connection>, envelope: Envelope) {
        if let Err(e) = self.hub.send_to(conn.id(), &envelope).await {
            tracing::error!(conn_id = %conn.id(), error = %e, "failed to send reply");
        }
    }

    /// Audit failures are logged and otherwise ignored.
    async fn record(
        &self,
        event: AuditEvent,
        actor: &UserId,
        channel_id: &ChannelId,
        metadata: AuditMetadata,
    ) {
        if let Err(e) = self.audit.log(event, actor, channel_id, metadata).await {
            tracing::warn!(%event, %actor, %channel_id, error = %e, "audit log failed");
        }
    }
}

impl<A, M, L, C> InboundHandler for Dispatcher<A, M, L, C>
where
    A: ChannelAccess,
    M: MessageStore,
    L: AuditLog,
    C: Codec,
{
    async fn handle_frame(&self, conn: &Arc<Connection>, data: Vec<u8>) {
        self.dispatch(conn, &data).await;
    }
}

fn require_channel(channel_id: ChannelId) -> Result<ChannelId, DispatchError> {
    if channel_id.is_blank() {
        Err(DispatchError::Invalid("channel_id is required".into()))
    } else {
        Ok(channel_id)
    }
}

fn presence(conn: &Connection, channel_id: &ChannelId) -> PresenceData {
    PresenceData {
        channel_id: channel_id.clone(),
        user_id: Some(conn.user_id().clone()),
        username: Some(conn.username().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryChannels, InMemoryMessages, TracingAudit};
    use chatwire_hub::Outbox;
    use chatwire_session::Identity;
    use chatwire_transport::ConnectionId;
    use serde_json::json;

    type TestDispatcher = Dispatcher<InMemoryChannels, InMemoryMessages, TracingAudit>;

    /// Fails every write.
    struct BrokenAudit;

    impl AuditLog for BrokenAudit {
        async fn log(
            &self,
            _event: AuditEvent,
            _actor: &UserId,
            _channel_id: &ChannelId,
            _metadata: AuditMetadata,
        ) -> Result<(), ServiceError> {
            Err(ServiceError::Backend("disk full".into()))
        }
    }

    /// Fails every write.
    struct BrokenStore;

    impl MessageStore for BrokenStore {
        async fn create(
            &self,
            _user_id: &UserId,
            _channel_id: &ChannelId,
            _content: &str,
        ) -> Result<crate::services::PersistedMessage, ServiceError> {
            Err(ServiceError::Backend("db down".into()))
        }
    }

    async fn seeded_channels() -> InMemoryChannels {
        let channels = InMemoryChannels::new();
        for name in ["general", "random"] {
            channels.create(name).await;
            for user in ["u-1", "u-2", "u-3"] {
                channels.add_member(&ChannelId::from(name), user).await.unwrap();
            }
        }
        channels
    }

    async fn dispatcher() -> TestDispatcher {
        Dispatcher::new(
            Arc::new(Hub::new()),
            seeded_channels().await,
            InMemoryMessages::new(),
            TracingAudit::new(),
        )
    }

    async fn connect<A, M, L>(
        d: &Dispatcher<A, M, L>,
        id: u64,
        user: &str,
        name: &str,
    ) -> (Arc<Connection>, Outbox)
    where
        A: ChannelAccess,
        M: MessageStore,
        L: AuditLog,
    {
        let (conn, outbox) = Connection::new(ConnectionId::new(id), Identity::new(user, name), 32);
        d.hub().register(Arc::clone(&conn)).await.unwrap();
        (conn, outbox)
    }

    async fn send<A, M, L>(d: &Dispatcher<A, M, L>, conn: &Arc<Connection>, value: serde_json::Value)
    where
        A: ChannelAccess,
        M: MessageStore,
        L: AuditLog,
    {
        d.dispatch(conn, value.to_string().as_bytes()).await;
    }

    fn drain(outbox: &mut Outbox) -> Vec<Envelope> {
        std::iter::from_fn(|| outbox.try_recv())
            .map(|frame| JsonCodec.decode(&frame).unwrap())
            .collect()
    }

    fn error_code(envelope: &Envelope) -> ErrorCode {
        match &envelope.payload {
            Payload::Error(data) => data.code,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    fn join(channel: &str) -> serde_json::Value {
        json!({ "type": "join", "data": { "channel_id": channel } })
    }

    fn chat(channel: &str, content: &str) -> serde_json::Value {
        json!({ "type": "chat", "data": { "channel_id": channel, "content": content } })
    }

    // -- ping / parse --------------------------------------------------

    #[tokio::test]
    async fn test_dispatch_ping_replies_pong() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, json!({ "type": "ping" })).await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, Payload::Pong);
    }

    #[tokio::test]
    async fn test_dispatch_pong_is_silent() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, json!({ "type": "pong" })).await;

        assert!(drain(&mut oa).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_malformed_json_replies_parse_error_and_stays_open() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        d.dispatch(&a, b"{not json").await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 1);
        assert_eq!(error_code(&got[0]), ErrorCode::ParseError);
        assert!(a.state().is_open());
        assert!(d.hub().is_registered(a.id()).await);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type_replies_parse_error() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, json!({ "type": "shout", "data": {} })).await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn test_dispatch_client_ack_replies_parse_error() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, json!({ "type": "ack", "data": { "message_id": "m" } })).await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::ParseError);
    }

    // -- join / leave --------------------------------------------------

    #[tokio::test]
    async fn test_join_confirms_to_actor_and_notifies_members() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(&d, &b, join("general")).await;

        assert!(d.hub().is_member(b.id(), &ChannelId::from("general")).await);
        let to_alice = drain(&mut oa);
        assert_eq!(to_alice.len(), 1);
        match &to_alice[0].payload {
            Payload::Join(p) => {
                assert_eq!(p.user_id, Some(UserId::from("u-2")));
                assert_eq!(p.username.as_deref(), Some("bob"));
            }
            other => panic!("expected join presence, got {other:?}"),
        }
        let to_bob = drain(&mut ob);
        assert_eq!(to_bob.len(), 1, "bob only gets his confirmation");
        assert!(matches!(to_bob[0].payload, Payload::Join(_)));

        let records = d.audit().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event, AuditEvent::ChannelJoined);
    }

    #[tokio::test]
    async fn test_join_twice_notifies_members_once() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, _ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(&d, &b, join("general")).await;
        send(&d, &b, join("general")).await;

        assert_eq!(drain(&mut oa).len(), 1);
        assert_eq!(d.hub().channel_member_count(&ChannelId::from("general")).await, 2);
    }

    #[tokio::test]
    async fn test_join_without_access_is_forbidden() {
        let d = dispatcher().await;
        let (x, mut ox) = connect(&d, 9, "u-9", "mallory").await;

        send(&d, &x, join("general")).await;

        assert_eq!(error_code(&drain(&mut ox)[0]), ErrorCode::Forbidden);
        assert!(!d.hub().is_member(x.id(), &ChannelId::from("general")).await);
    }

    #[tokio::test]
    async fn test_join_banned_user_is_forbidden() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        d.channels()
            .ban(&ChannelId::from("general"), &UserId::from("u-1"))
            .await
            .unwrap();

        send(&d, &a, join("general")).await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_join_unknown_channel_is_not_found() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, join("nowhere")).await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::ChannelNotFound);
    }

    #[tokio::test]
    async fn test_join_blank_channel_is_invalid() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(&d, &a, join("  ")).await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::InvalidMessage);
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_members() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &a, join("general")).await;
        send(&d, &b, join("general")).await;
        drain(&mut oa);
        drain(&mut ob);

        send(&d, &b, json!({ "type": "leave", "data": { "channel_id": "general" } })).await;

        assert!(matches!(drain(&mut oa)[0].payload, Payload::Leave(_)));
        assert!(matches!(drain(&mut ob)[0].payload, Payload::Leave(_)));
        assert_eq!(d.hub().channel_member_count(&ChannelId::from("general")).await, 1);
    }

    #[tokio::test]
    async fn test_leave_allowed_for_banned_user() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        d.channels()
            .ban(&ChannelId::from("general"), &UserId::from("u-1"))
            .await
            .unwrap();
        drain(&mut oa);

        send(&d, &a, json!({ "type": "leave", "data": { "channel_id": "general" } })).await;

        assert!(matches!(drain(&mut oa)[0].payload, Payload::Leave(_)));
        assert!(!d.hub().is_member(a.id(), &ChannelId::from("general")).await);
    }

    // -- chat ----------------------------------------------------------

    #[tokio::test]
    async fn test_chat_broadcasts_canonical_copy_to_all_members_including_sender() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        let (c, mut oc) = connect(&d, 3, "u-3", "carol").await;
        send(&d, &a, join("general")).await;
        send(&d, &b, join("general")).await;
        send(&d, &c, join("random")).await;
        drain(&mut oa);
        drain(&mut ob);
        drain(&mut oc);

        send(
            &d,
            &a,
            json!({ "type": "chat", "data": {
                "channel_id": "general", "content": "hello", "sender_name": "spoofed"
            }}),
        )
        .await;

        let to_alice = drain(&mut oa);
        let to_bob = drain(&mut ob);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_alice[0], to_bob[0]);
        match &to_bob[0].payload {
            Payload::Chat(data) => {
                assert_eq!(data.content, "hello");
                assert_eq!(data.sender_id, Some(UserId::from("u-1")));
                assert_eq!(data.sender_name.as_deref(), Some("alice"));
                assert!(data.message_id.is_some());
                assert!(data.created_at.is_some());
                assert_eq!(to_bob[0].message_id, data.message_id);
            }
            other => panic!("expected chat, got {other:?}"),
        }
        assert!(drain(&mut oc).is_empty());
        assert_eq!(d.messages().count().await, 1);
        assert_eq!(d.audit().records().last().unwrap().event, AuditEvent::MessageSent);
    }

    #[tokio::test]
    async fn test_chat_to_unjoined_channel_replies_error_without_broadcast() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &b, join("general")).await;
        drain(&mut ob);

        send(&d, &a, chat("general", "sneaky")).await;

        let to_alice = drain(&mut oa);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(error_code(&to_alice[0]), ErrorCode::NotInChannel);
        assert!(drain(&mut ob).is_empty(), "nothing was broadcast");
        assert_eq!(d.messages().count().await, 0);
    }

    #[tokio::test]
    async fn test_chat_after_ban_is_forbidden() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);
        d.channels()
            .ban(&ChannelId::from("general"), &UserId::from("u-1"))
            .await
            .unwrap();

        send(&d, &a, chat("general", "hi")).await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 1);
        assert_eq!(error_code(&got[0]), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_and_oversized_content() {
        let d = dispatcher()
            .await
            .with_config(DispatchConfig { max_content_chars: 5 });
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(&d, &a, chat("general", "   ")).await;
        send(&d, &a, chat("general", "toolong")).await;
        send(&d, &a, chat("general", "héllo")).await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 3);
        assert_eq!(error_code(&got[0]), ErrorCode::InvalidMessage);
        assert_eq!(error_code(&got[1]), ErrorCode::InvalidMessage);
        assert!(matches!(got[2].payload, Payload::Chat(_)), "limit counts characters");
    }

    #[tokio::test]
    async fn test_chat_with_nonce_is_acked_after_broadcast() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(
            &d,
            &a,
            json!({ "type": "chat", "data": { "channel_id": "general", "content": "hi", "nonce": "c-1" } }),
        )
        .await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 2);
        let Payload::Chat(chat) = &got[0].payload else {
            panic!("expected chat first");
        };
        assert!(chat.nonce.is_none(), "nonce is only echoed in the ack");
        match &got[1].payload {
            Payload::Ack(ack) => {
                assert_eq!(Some(&ack.message_id), chat.message_id.as_ref());
                assert_eq!(ack.nonce.as_deref(), Some("c-1"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_store_failure_replies_internal_error() {
        let d = Dispatcher::new(
            Arc::new(Hub::new()),
            seeded_channels().await,
            BrokenStore,
            TracingAudit::new(),
        );
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(&d, &a, chat("general", "hi")).await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 1);
        assert_eq!(error_code(&got[0]), ErrorCode::InternalError);
        match &got[0].payload {
            Payload::Error(data) => assert!(!data.message.contains("db down")),
            _ => unreachable!(),
        }
        assert!(a.state().is_open());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_chat() {
        let d = Dispatcher::new(
            Arc::new(Hub::new()),
            seeded_channels().await,
            InMemoryMessages::new(),
            BrokenAudit,
        );
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        send(&d, &a, join("general")).await;
        drain(&mut oa);

        send(&d, &a, chat("general", "still works")).await;

        let got = drain(&mut oa);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0].payload, Payload::Chat(_)));
    }

    // -- typing --------------------------------------------------------

    #[tokio::test]
    async fn test_typing_excludes_sender_and_is_not_persisted() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &a, join("general")).await;
        send(&d, &b, join("general")).await;
        drain(&mut oa);
        drain(&mut ob);

        send(
            &d,
            &a,
            json!({ "type": "typing", "data": { "channel_id": "general", "is_typing": true } }),
        )
        .await;

        assert!(drain(&mut oa).is_empty());
        let to_bob = drain(&mut ob);
        assert!(matches!(
            &to_bob[0].payload,
            Payload::Typing(TypingData { is_typing: true, user_id: Some(u), .. }) if u.as_str() == "u-1"
        ));
        assert_eq!(d.messages().count().await, 0);
    }

    #[tokio::test]
    async fn test_typing_in_unjoined_channel_is_rejected() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;

        send(
            &d,
            &a,
            json!({ "type": "typing", "data": { "channel_id": "general", "is_typing": true } }),
        )
        .await;

        assert_eq!(error_code(&drain(&mut oa)[0]), ErrorCode::NotInChannel);
    }

    // -- eviction ------------------------------------------------------

    #[tokio::test]
    async fn test_evict_from_channel_keeps_connection_open() {
        let d = dispatcher().await;
        let (a, mut oa) = connect(&d, 1, "u-1", "alice").await;
        let (b, mut ob) = connect(&d, 2, "u-2", "bob").await;
        send(&d, &a, join("general")).await;
        send(&d, &b, join("general")).await;
        drain(&mut oa);
        drain(&mut ob);

        let evicted = d
            .evict_from_channel(&UserId::from("u-2"), &ChannelId::from("general"))
            .await
            .unwrap();

        assert!(evicted);
        assert!(!d.hub().is_member(b.id(), &ChannelId::from("general")).await);
        assert!(b.state().is_open());
        assert!(matches!(drain(&mut oa)[0].payload, Payload::Leave(_)));
        assert!(matches!(drain(&mut ob)[0].payload, Payload::Leave(_)));

        let again = d
            .evict_from_channel(&UserId::from("u-2"), &ChannelId::from("general"))
            .await
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_dispatch_error_codes() {
        let general = ChannelId::from("general");
        assert_eq!(DispatchError::Parse("x".into()).code(), ErrorCode::ParseError);
        assert_eq!(DispatchError::NotInChannel(general.clone()).code(), ErrorCode::NotInChannel);
        assert_eq!(DispatchError::Forbidden(general).code(), ErrorCode::Forbidden);
        assert_eq!(
            DispatchError::Service(ServiceError::NotFound("x".into())).code(),
            ErrorCode::ChannelNotFound
        );
        assert_eq!(
            DispatchError::Service(ServiceError::Backend("x".into())).code(),
            ErrorCode::InternalError
        );
    }
}
