//! Per-connection task: upgrade, authenticate, register, serve.
//!
//! Each accepted TCP stream gets its own Tokio task running
//! [`handle_connection`]:
//!   1. HTTP upgrade on the configured path, token extracted
//!   2. Token validated by the identity collaborator
//!   3. Connection created and registered with the hub
//!   4. Inbound and outbound loops until the connection closes
//!
//! Steps 1 and 2 share one deadline (`handshake_timeout`).

use std::sync::Arc;

use chatwire_hub::{Connection, serve};
use chatwire_session::{Authenticator, CloseReason};
use chatwire_transport::{FrameSink, PendingUpgrade, Upgraded};
use tokio::time::{Instant, timeout_at};

use crate::ChatwireError;
use crate::server::ServerState;
use crate::services::{AuditLog, ChannelAccess, MessageStore};

/// Close code sent when the upgrade token is rejected.
const POLICY_VIOLATION: u16 = 1008;

/// Close code sent when the identity service does not answer in time.
const TRY_AGAIN_LATER: u16 = 1013;

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<Au, A, M, L>(
    pending: PendingUpgrade,
    state: Arc<ServerState<Au, A, M, L>>,
) -> Result<CloseReason, ChatwireError>
where
    Au: Authenticator,
    A: ChannelAccess,
    M: MessageStore,
    L: AuditLog,
{
    let peer = pending.peer_addr();
    let deadline = Instant::now() + state.config.handshake_timeout;

    let Upgraded {
        id,
        token,
        mut sink,
        stream,
        ..
    } = match timeout_at(deadline, pending.upgrade()).await {
        Ok(upgraded) => upgraded?,
        Err(_) => {
            tracing::info!(%peer, "upgrade timed out");
            return Err(ChatwireError::HandshakeTimeout);
        }
    };
    tracing::debug!(conn_id = %id, %peer, "upgraded");

    let identity = match timeout_at(deadline, state.auth.authenticate(&token)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            tracing::info!(conn_id = %id, %peer, error = %e, "authentication failed");
            if let Err(close_err) = sink.close(POLICY_VIOLATION, "unauthorized").await {
                tracing::debug!(conn_id = %id, error = %close_err, "failed to send close frame");
            }
            return Err(e.into());
        }
        Err(_) => {
            tracing::info!(conn_id = %id, %peer, "authentication timed out");
            if let Err(close_err) = sink.close(TRY_AGAIN_LATER, "authentication timed out").await {
                tracing::debug!(conn_id = %id, error = %close_err, "failed to send close frame");
            }
            return Err(ChatwireError::HandshakeTimeout);
        }
    };
    tracing::info!(conn_id = %id, user_id = %identity.user_id, %peer, "authenticated");

    let (conn, outbox) = Connection::new(id, identity, state.config.outbound_capacity);
    if let Err(e) = state.hub.register(Arc::clone(&conn)).await {
        let reason = CloseReason::ServerShutdown;
        let reason_text = reason.to_string();
        if let Err(close_err) = sink.close(reason.close_code(), &reason_text).await {
            tracing::debug!(conn_id = %id, error = %close_err, "failed to send close frame");
        }
        return Err(e.into());
    }

    let reason = serve(
        Arc::clone(&state.hub),
        conn,
        outbox,
        sink,
        stream,
        &state.dispatcher,
        state.config.clone(),
    )
    .await;
    Ok(reason)
}
