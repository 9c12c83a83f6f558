//! Read-only snapshots for observability endpoints.

use std::collections::BTreeMap;

use chatwire_protocol::{ChannelId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One live connection as seen by an admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub user_id: UserId,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub channels: Vec<ChannelId>,
}

/// Process-wide totals.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    /// Member count per channel with at least one member.
    pub channel_stats: BTreeMap<ChannelId, usize>,
    pub active_users: Vec<ConnectionInfo>,
    pub server_time: DateTime<Utc>,
}

/// Members of a single channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_id: ChannelId,
    pub total_users: usize,
    pub connected_users: Vec<ConnectionInfo>,
}
