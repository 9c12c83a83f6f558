//! Core protocol types for chatwire's wire format.
//!
//! Every frame on the socket is one [`Envelope`]: a JSON object with a
//! required `type` tag, a `data` object whose shape depends on the tag,
//! and optional server-assigned `timestamp` and `message_id` fields.
//!
//! ```text
//! {"type":"chat","data":{"channel_id":"general","content":"hi"}}
//! {"type":"ping"}
//! {"type":"error","data":{"code":"PARSE_ERROR","message":"..."}}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of an authenticated user, as issued by the identity service.
///
/// Serialized as the bare string (`#[serde(transparent)]`).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a channel (a named topic connections join).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for an empty or whitespace-only id.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Canonical id of a persisted chat message, assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable codes carried by `error` envelopes.
///
/// Clients switch on these, so the serialized names never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed JSON or an unknown/unroutable type tag.
    ParseError,
    /// Well-formed but semantically invalid (blank channel, empty content).
    InvalidMessage,
    /// The connection has not joined the target channel.
    NotInChannel,
    /// The user may not access the channel (not a member, or banned).
    Forbidden,
    /// The channel does not exist.
    ChannelNotFound,
    /// A backend collaborator failed.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::NotInChannel => "NOT_IN_CHANNEL",
            Self::Forbidden => "FORBIDDEN",
            Self::ChannelNotFound => "CHANNEL_NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload data
// ---------------------------------------------------------------------------

/// A chat message.
///
/// Clients submit only `channel_id`, `content` and optionally `nonce`.
/// The server fills in the rest from the persisted record before fanning
/// the message out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Client-chosen correlation value, echoed back in the `ack`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Join/leave presence. `user_id` and `username` are server-filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Typing indicator. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingData {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
}

/// Confirms a chat submission that carried a `nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

// ---------------------------------------------------------------------------
// Payload: the tagged union
// ---------------------------------------------------------------------------

/// The variant part of an envelope.
///
/// Adjacently tagged: the tag lands in `type`, the variant data in
/// `data`. Unit variants (`ping`, `pong`) carry no `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Chat(ChatData),
    Join(PresenceData),
    Leave(PresenceData),
    Typing(TypingData),
    Ping,
    Pong,
    Error(ErrorData),
    Ack(AckData),
}

impl Payload {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Typing(_) => "typing",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error(_) => "error",
            Self::Ack(_) => "ack",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope: the top-level wire format
// ---------------------------------------------------------------------------

/// The top-level message. Every frame on the socket is one `Envelope`.
///
/// Envelopes are ephemeral: they are built, encoded once, and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,

    /// Set on every server-originated envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Mirrors `data.message_id` for persisted chat messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl Envelope {
    /// Wraps a payload without any server metadata (client side).
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: None,
            message_id: None,
        }
    }

    /// Wraps a payload stamped with the current server time.
    pub fn stamped(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: Some(Utc::now()),
            message_id: None,
        }
    }

    /// A persisted chat message, with `message_id` mirrored to the top level.
    pub fn chat(data: ChatData) -> Self {
        let message_id = data.message_id.clone();
        Self {
            message_id,
            ..Self::stamped(Payload::Chat(data))
        }
    }

    pub fn ping() -> Self {
        Self::stamped(Payload::Ping)
    }

    pub fn pong() -> Self {
        Self::stamped(Payload::Pong)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::stamped(Payload::Error(ErrorData {
            code,
            message: message.into(),
        }))
    }

    pub fn ack(message_id: MessageId, nonce: Option<String>) -> Self {
        Self::stamped(Payload::Ack(AckData { message_id, nonce }))
    }

    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
