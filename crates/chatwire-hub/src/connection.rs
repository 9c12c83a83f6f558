//! One live session: identity, lifecycle state, and the bounded outbound
//! queue that decouples fan-out producers from the socket writer.
//!
//! A [`Connection`] is shared (`Arc`) between the hub, the dispatcher and
//! the connection's own loops. The receiving end of its queue, the
//! [`Outbox`], is owned by the outbound loop alone.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use chatwire_protocol::UserId;
use chatwire_session::{CloseReason, ConnectionState, Identity};
use chatwire_transport::ConnectionId;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::EnqueueError;

/// An encoded envelope, shared between every recipient of a broadcast.
pub type Frame = Arc<[u8]>;

/// Shared handle to one authenticated session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    connected_at: DateTime<Utc>,
    /// Unix milliseconds of the last frame read from the peer.
    last_seen_ms: AtomicI64,
    /// Lifecycle state. Both loops watch it to notice a close.
    state: watch::Sender<ConnectionState>,
    /// Set exactly once, by whoever closes the connection first.
    close_reason: OnceLock<CloseReason>,
    outbound: mpsc::Sender<Frame>,
}

impl Connection {
    /// Creates a connection for an identity the authenticator has just
    /// confirmed. It starts in `Authenticated` and becomes `Active` once
    /// the hub registers it.
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        outbound_capacity: usize,
    ) -> (Arc<Self>, Outbox) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Authenticated);
        let now = Utc::now();
        let conn = Self {
            id,
            identity,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            state,
            close_reason: OnceLock::new(),
            outbound: tx,
        };
        (Arc::new(conn), Outbox { rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    /// Records activity from the peer.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The reason recorded by the first [`close`](Self::close), if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Frames currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// A receiver that wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Authenticated → Active`. Returns `false` if the connection was
    /// not in `Authenticated`.
    pub(crate) fn activate(&self) -> bool {
        self.transition(ConnectionState::Active)
    }

    /// `Closing → Closed`, once both loops have finished.
    pub(crate) fn mark_closed(&self) -> bool {
        self.transition(ConnectionState::Closed)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Moves the connection to `Closing`, which stops both loops.
    ///
    /// Idempotent: only the first call records its reason and returns
    /// `true`; later calls (from any state) do nothing.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }
        self.transition(ConnectionState::Closing);
        if reason.is_fault() {
            tracing::warn!(conn_id = %self.id, user_id = %self.identity.user_id, %reason, "closing connection");
        } else {
            tracing::debug!(conn_id = %self.id, user_id = %self.identity.user_id, %reason, "closing connection");
        }
        true
    }

    /// Puts a frame on the outbound queue without waiting.
    ///
    /// A full queue means the peer is not keeping up: the connection is
    /// closed as a slow consumer instead of silently dropping the frame.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if !self.state().is_open() {
            return Err(EnqueueError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.close(CloseReason::SlowConsumer);
                Err(EnqueueError::SlowConsumer)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }
}

/// Receiving end of a connection's outbound queue (FIFO).
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Frame>,
}

impl Outbox {
    /// Waits for the next frame. `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Takes the next frame if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Closes the queue: later enqueues fail with `Closed`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
