//! Wire protocol for chatwire.
//!
//! - **Types** ([`Envelope`], [`Payload`], [`ErrorCode`], id newtypes):
//!   the structures that travel on the socket.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how they become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer knows nothing about connections or channels'
//! membership; it only describes and (de)serializes messages.

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    AckData, ChannelId, ChatData, Envelope, ErrorCode, ErrorData, MessageId,
    Payload, PresenceData, TypingData, UserId,
};
