//! The two per-connection loops.
//!
//! [`serve`] drives one registered connection until it closes: the
//! outbound loop runs on its own task, pulling from the [`Outbox`] and
//! writing to the [`FrameSink`]; the inbound loop runs on the calling
//! task, reading from the [`FrameStream`] and handing data frames to an
//! [`InboundHandler`]. Either loop stops the other by closing the
//! connection, which both watch.

use std::future::Future;
use std::sync::Arc;

use chatwire_protocol::{Codec, Envelope};
use chatwire_session::CloseReason;
use chatwire_transport::{FrameSink, FrameStream, Inbound};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{Connection, ConnectionConfig, Hub, Outbox};

/// Receives every data frame a connection reads, in order.
///
/// Frames from one connection are handled one at a time; the next read
/// starts once the returned future completes.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle_frame(
        &self,
        conn: &Arc<Connection>,
        data: Vec<u8>,
    ) -> impl Future<Output = ()> + Send;
}

/// Runs a registered connection to completion.
///
/// Returns once both loops have stopped, the connection has been
/// unregistered from the hub and marked `Closed`. The returned reason is
/// the one recorded by whichever side closed first.
pub async fn serve<C, S, R, H>(
    hub: Arc<Hub<C>>,
    conn: Arc<Connection>,
    outbox: Outbox,
    sink: S,
    mut stream: R,
    handler: &H,
    config: ConnectionConfig,
) -> CloseReason
where
    C: Codec,
    S: FrameSink,
    R: FrameStream,
    H: InboundHandler,
{
    let writer = tokio::spawn(write_loop(
        Arc::clone(&hub),
        Arc::clone(&conn),
        outbox,
        sink,
        config.clone(),
    ));

    read_loop(&conn, &mut stream, handler, &config).await;

    if let Err(e) = writer.await {
        tracing::error!(conn_id = %conn.id(), error = %e, "outbound loop panicked");
        conn.close(CloseReason::WriteFailed);
    }

    hub.unregister(conn.id()).await;
    conn.mark_closed();

    let reason = conn.close_reason().unwrap_or(CloseReason::PeerClosed);
    tracing::info!(
        conn_id = %conn.id(),
        user_id = %conn.user_id(),
        %reason,
        "connection closed"
    );
    reason
}

async fn read_loop<R, H>(
    conn: &Arc<Connection>,
    stream: &mut R,
    handler: &H,
    config: &ConnectionConfig,
) where
    R: FrameStream,
    H: InboundHandler,
{
    let mut state = conn.subscribe();

    while conn.state().is_open() {
        let read = tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            read = time::timeout(config.pong_timeout, stream.recv()) => read,
        };

        match read {
            Ok(Ok(Some(Inbound::Data(data)))) => {
                conn.touch();
                handler.handle_frame(conn, data).await;
            }
            Ok(Ok(Some(Inbound::Heartbeat))) => conn.touch(),
            Ok(Ok(None)) => {
                conn.close(CloseReason::PeerClosed);
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "read failed");
                conn.close(CloseReason::ReadFailed);
                break;
            }
            Err(_) => {
                conn.close(CloseReason::ReadTimeout);
                break;
            }
        }
    }
}

async fn write_loop<C, S>(
    hub: Arc<Hub<C>>,
    conn: Arc<Connection>,
    mut outbox: Outbox,
    mut sink: S,
    config: ConnectionConfig,
) where
    C: Codec,
    S: FrameSink,
{
    let mut state = conn.subscribe();
    let period = config.ping_period();
    let mut ping = time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while conn.state().is_open() {
        let frame = tokio::select! {
            biased;
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => match hub.encode(&Envelope::ping()) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), error = %e, "failed to encode ping");
                    continue;
                }
            },
        };

        match time::timeout(config.write_timeout, sink.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "write failed");
                conn.close(CloseReason::WriteFailed);
                break;
            }
            Err(_) => {
                conn.close(CloseReason::WriteTimeout);
                break;
            }
        }
    }

    outbox.close();
    let reason = conn.close_reason().unwrap_or(CloseReason::PeerClosed);
    let reason_text = reason.to_string();
    let close = sink.close(reason.close_code(), &reason_text);
    match time::timeout(config.write_timeout, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(conn_id = %conn.id(), error = %e, "failed to send close frame");
        }
        Err(_) => {
            tracing::debug!(conn_id = %conn.id(), "close frame timed out");
        }
    }
}
