//! Connection registry and channel fan-out for chatwire.
//!
//! - [`Hub`]: which connections are live, which channels each has
//!   joined, and broadcasting to them
//! - [`Connection`]: one session's identity, lifecycle state and
//!   bounded outbound queue
//! - [`serve`]: the inbound and outbound loops for one connection
//!
//! The hub never performs socket I/O. Broadcasting only enqueues encoded
//! frames; each connection's outbound loop writes them.

mod config;
mod connection;
mod error;
mod hub;
mod serve;
mod stats;

pub use config::ConnectionConfig;
pub use connection::{Connection, Frame, Outbox};
pub use error::{EnqueueError, HubError};
pub use hub::Hub;
pub use serve::{InboundHandler, serve};
pub use stats::{ChannelStats, ConnectionInfo, HubStats};
