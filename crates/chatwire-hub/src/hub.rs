//! The hub: process-wide registry of live connections and the
//! channel-membership index used for fan-out.
//!
//! All registry and membership mutations happen under one `RwLock`, so
//! the two membership indexes (connection → channels and channel →
//! connections) can never disagree. Broadcasts take a snapshot of the
//! targets under the read lock and release it before touching any
//! outbound queue; a slow member therefore never stalls joins, leaves or
//! other broadcasts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chatwire_protocol::{ChannelId, Codec, Envelope, JsonCodec, UserId};
use chatwire_session::CloseReason;
use chatwire_transport::ConnectionId;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::stats::{ChannelStats, ConnectionInfo, HubStats};
use crate::{Connection, EnqueueError, Frame, HubError};

/// The mutable part of the hub. Only ever touched with the lock held.
#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// connection → channels it has joined.
    joined: HashMap<ConnectionId, HashSet<ChannelId>>,
    /// channel → member connections. Channels with no members are
    /// removed, never left as empty sets.
    channels: HashMap<ChannelId, HashSet<ConnectionId>>,
    /// At most one live connection per user.
    users: HashMap<UserId, ConnectionId>,
    shut_down: bool,
}

impl HubState {
    /// Removes a connection from every index in one step.
    fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(&id)?;
        for channel in self.joined.remove(&id).unwrap_or_default() {
            self.drop_member(&channel, id);
        }
        if self.users.get(conn.user_id()) == Some(&id) {
            self.users.remove(conn.user_id());
        }
        Some(conn)
    }

    fn leave(&mut self, id: ConnectionId, channel: &ChannelId) -> bool {
        let removed = self
            .joined
            .get_mut(&id)
            .is_some_and(|channels| channels.remove(channel));
        if removed {
            self.drop_member(channel, id);
        }
        removed
    }

    fn drop_member(&mut self, channel: &ChannelId, id: ConnectionId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn members(&self, channel: &ChannelId) -> Vec<Arc<Connection>> {
        let mut members: Vec<Arc<Connection>> = self
            .channels
            .get(channel)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect();
        members.sort_by_key(|conn| conn.id());
        members
    }

    fn info(&self, conn: &Connection) -> ConnectionInfo {
        let mut channels: Vec<ChannelId> = self
            .joined
            .get(&conn.id())
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        channels.sort();
        ConnectionInfo {
            connection_id: conn.id().into_inner(),
            user_id: conn.user_id().clone(),
            username: conn.username().to_string(),
            connected_at: conn.connected_at(),
            last_seen_at: conn.last_seen_at(),
            channels,
        }
    }
}

/// Registry of connections and channel membership, and the fan-out
/// broadcaster.
///
/// Constructed once at startup and shared by `Arc` with everything that
/// needs it; [`shutdown`](Self::shutdown) tears it down.
pub struct Hub<C: Codec = JsonCodec> {
    state: RwLock<HubState>,
    codec: C,
}

impl Hub {
    /// Creates an empty hub speaking JSON.
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Hub<C> {
    pub fn with_codec(codec: C) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            codec,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Encodes an envelope into a shareable frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Frame, HubError> {
        Ok(Frame::from(self.codec.encode(envelope)?))
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    /// Adds a connection to the registry and the user index, and makes
    /// it `Active`.
    ///
    /// Returns `Ok(false)` without changing anything if the connection is
    /// already registered or already closing. If the user already had a
    /// live connection, that older one is unregistered and closed with
    /// [`CloseReason::Replaced`].
    ///
    /// # Errors
    /// [`HubError::ShutDown`] after [`shutdown`](Self::shutdown); the
    /// connection is closed.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<bool, HubError> {
        let id = conn.id();
        let evicted = {
            let mut state = self.state.write().await;
            if state.shut_down {
                drop(state);
                conn.close(CloseReason::ServerShutdown);
                return Err(HubError::ShutDown);
            }
            if state.connections.contains_key(&id) || !conn.state().is_open() {
                return Ok(false);
            }

            let previous = state.users.insert(conn.user_id().clone(), id);
            let evicted = previous.and_then(|old| state.remove(old));
            state.connections.insert(id, Arc::clone(&conn));
            state.joined.insert(id, HashSet::new());
            conn.activate();
            evicted
        };

        if let Some(old) = evicted {
            old.close(CloseReason::Replaced);
            tracing::info!(
                conn_id = %old.id(),
                user_id = %old.user_id(),
                replaced_by = %id,
                "connection replaced"
            );
        }
        tracing::info!(conn_id = %id, user_id = %conn.user_id(), "connection registered");
        Ok(true)
    }

    /// Removes a connection from the registry, the user index and every
    /// channel it had joined. Unknown ids are a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.state.write().await.remove(id);
        match removed {
            Some(conn) => {
                tracing::info!(conn_id = %id, user_id = %conn.user_id(), "connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Forcibly disconnects a connection (administrative kick or ban).
    pub async fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let removed = self.state.write().await.remove(id);
        match removed {
            Some(conn) => {
                conn.close(reason);
                tracing::info!(conn_id = %id, user_id = %conn.user_id(), %reason, "connection disconnected");
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------

    /// Adds the connection to a channel. Returns `true` only if it was not
    /// a member before; unregistered connections are ignored.
    pub async fn join_channel(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        let mut state = self.state.write().await;
        let newly_joined = match state.joined.get_mut(&id) {
            Some(channels) => channels.insert(channel.clone()),
            None => return false,
        };
        if newly_joined {
            state.channels.entry(channel.clone()).or_default().insert(id);
            tracing::debug!(conn_id = %id, %channel, "joined channel");
        }
        newly_joined
    }

    /// Removes the connection from a channel. Returns `true` only if it
    /// was a member.
    pub async fn leave_channel(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        let left = self.state.write().await.leave(id, channel);
        if left {
            tracing::debug!(conn_id = %id, %channel, "left channel");
        }
        left
    }

    /// Removes a user's live connection from a channel without closing
    /// it, e.g. when the user is banned from that channel.
    pub async fn remove_user_from_channel(
        &self,
        user_id: &UserId,
        channel: &ChannelId,
    ) -> bool {
        let mut state = self.state.write().await;
        match state.users.get(user_id).copied() {
            Some(id) => state.leave(id, channel),
            None => false,
        }
    }

    // -----------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------

    /// Delivers an envelope to every current member of a channel except
    /// `exclude`. Returns how many queues accepted it.
    ///
    /// Members are snapshotted under the lock; enqueueing happens after
    /// it is released. A member that joins after the snapshot does not
    /// get this envelope.
    pub async fn broadcast_to_channel(
        &self,
        channel: &ChannelId,
        envelope: &Envelope,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, HubError> {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read().await;
            state
                .members(channel)
                .into_iter()
                .filter(|conn| Some(conn.id()) != exclude)
                .collect()
        };
        if targets.is_empty() {
            return Ok(0);
        }
        let frame = self.encode(envelope)?;
        let delivered = self.deliver(targets, frame).await;
        tracing::debug!(%channel, kind = envelope.kind(), delivered, "broadcast to channel");
        Ok(delivered)
    }

    /// Delivers an envelope to the user's live connection, if any.
    pub async fn broadcast_to_user(
        &self,
        user_id: &UserId,
        envelope: &Envelope,
    ) -> Result<bool, HubError> {
        match self.find_by_user(user_id).await {
            Some(conn) => self.send(conn, envelope).await,
            None => Ok(false),
        }
    }

    /// Delivers an envelope to one connection (a direct reply).
    pub async fn send_to(
        &self,
        id: ConnectionId,
        envelope: &Envelope,
    ) -> Result<bool, HubError> {
        let target = self.state.read().await.connections.get(&id).cloned();
        match target {
            Some(conn) => self.send(conn, envelope).await,
            None => Ok(false),
        }
    }

    async fn send(&self, conn: Arc<Connection>, envelope: &Envelope) -> Result<bool, HubError> {
        let frame = self.encode(envelope)?;
        Ok(self.deliver(vec![conn], frame).await == 1)
    }

    /// Enqueues one frame on each target. Slow consumers are closed by
    /// their own `enqueue` and unregistered here, after all targets have
    /// been served.
    async fn deliver(&self, targets: Vec<Arc<Connection>>, frame: Frame) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        for conn in targets {
            match conn.enqueue(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::SlowConsumer) => slow.push(conn.id()),
                Err(EnqueueError::Closed) => {}
            }
        }
        for id in slow {
            tracing::warn!(conn_id = %id, "outbound queue full, dropping slow consumer");
            self.unregister(id).await;
        }
        delivered
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn channel_member_count(&self, channel: &ChannelId) -> usize {
        self.state
            .read()
            .await
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    pub async fn is_member(&self, id: ConnectionId, channel: &ChannelId) -> bool {
        self.state
            .read()
            .await
            .joined
            .get(&id)
            .is_some_and(|channels| channels.contains(channel))
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(&id)
    }

    pub async fn find_by_user(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .and_then(|id| state.connections.get(id))
            .cloned()
    }

    /// Current members of a channel, ordered by connection id.
    pub async fn list_channel_members(&self, channel: &ChannelId) -> Vec<Arc<Connection>> {
        self.state.read().await.members(channel)
    }

    /// Channels a connection has joined, sorted.
    pub async fn channels_of(&self, id: ConnectionId) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .state
            .read()
            .await
            .joined
            .get(&id)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        channels.sort();
        channels
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.read().await;
        let mut conns: Vec<&Arc<Connection>> = state.connections.values().collect();
        conns.sort_by_key(|conn| conn.id());
        HubStats {
            total_connections: state.connections.len(),
            channel_stats: state
                .channels
                .iter()
                .map(|(channel, members)| (channel.clone(), members.len()))
                .collect(),
            active_users: conns.into_iter().map(|conn| state.info(conn)).collect(),
            server_time: Utc::now(),
        }
    }

    pub async fn channel_stats(&self, channel: &ChannelId) -> ChannelStats {
        let state = self.state.read().await;
        let connected_users: Vec<ConnectionInfo> = state
            .members(channel)
            .iter()
            .map(|conn| state.info(conn))
            .collect();
        ChannelStats {
            channel_id: channel.clone(),
            total_users: connected_users.len(),
            connected_users,
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Closes every live connection and clears all indexes. Later
    /// registrations fail with [`HubError::ShutDown`]. Idempotent.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut state = self.state.write().await;
            state.shut_down = true;
            state.joined.clear();
            state.channels.clear();
            state.users.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close(CloseReason::ServerShutdown);
        }
        if !drained.is_empty() {
            tracing::info!(connections = drained.len(), "hub shut down");
        }
        drained.len()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.read().await.shut_down
    }
}
