//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Accepting is split in two steps so a slow handshake never blocks the
//! accept loop: [`WebSocketTransport::accept`] only takes the TCP stream,
//! and [`PendingUpgrade::upgrade`] runs the HTTP upgrade inside the
//! per-connection task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use url::form_urlencoded;

use crate::{ConnectionId, FrameSink, FrameStream, Inbound, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Settings applied to every upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// The only request path that may be upgraded.
    pub path: String,

    /// Largest inbound message (and frame) accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_frame_size: 512,
        }
    }
}

/// A WebSocket listener bound to one address.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: UpgradeConfig,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(
        addr: &str,
        config: UpgradeConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, path = %config.path, "WebSocket transport listening");
        Ok(Self { listener, config })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next TCP connection. The WebSocket handshake is
    /// deferred to [`PendingUpgrade::upgrade`].
    pub async fn accept(&self) -> Result<PendingUpgrade, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        Ok(PendingUpgrade {
            stream,
            peer,
            config: self.config.clone(),
        })
    }
}

/// An accepted TCP connection that has not been upgraded yet.
pub struct PendingUpgrade {
    stream: TcpStream,
    peer: SocketAddr,
    config: UpgradeConfig,
}

impl PendingUpgrade {
    /// The remote address of the pending connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Performs the HTTP upgrade.
    ///
    /// The request must target the configured path (404 otherwise) and
    /// carry a token (401 otherwise). The token is only extracted here;
    /// validating it is up to the caller.
    pub async fn upgrade(self) -> Result<Upgraded, TransportError> {
        let Self {
            stream,
            peer,
            config,
        } = self;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_frame_size);
        ws_config.max_frame_size = Some(config.max_frame_size);

        let mut token = None;
        let callback = |req: &Request, resp: Response| {
            if req.uri().path() != config.path {
                return Err(reject(StatusCode::NOT_FOUND, "not found"));
            }
            match extract_token(req) {
                Some(t) => {
                    token = Some(t);
                    Ok(resp)
                }
                None => Err(reject(StatusCode::UNAUTHORIZED, "missing token")),
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(ws_config),
        )
        .await
        .map_err(|e| TransportError::UpgradeRejected(e.to_string()))?;

        let token = token.ok_or_else(|| {
            TransportError::UpgradeRejected("missing token".into())
        })?;

        let id =
            ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %peer, "upgraded WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(Upgraded {
            id,
            peer,
            token,
            sink: WebSocketSink { inner: sink },
            stream: WebSocketFrames { inner: stream },
        })
    }
}

/// A successfully upgraded connection, split into its two halves.
pub struct Upgraded {
    /// Unique identifier assigned at upgrade time.
    pub id: ConnectionId,
    /// The remote address.
    pub peer: SocketAddr,
    /// The identity token presented with the upgrade request.
    pub token: String,
    /// Write half.
    pub sink: WebSocketSink,
    /// Read half.
    pub stream: WebSocketFrames,
}

/// Pulls the identity token out of an upgrade request.
///
/// Looked up in order: `token` query parameter, `Authorization: Bearer`
/// header, `token` cookie. Query and cookie values are percent-decoded.
/// Empty values count as missing.
pub fn extract_token(req: &Request) -> Option<String> {
    let from_query = req
        .uri()
        .query()
        .and_then(|query| token_pair(query.as_bytes()));

    let from_header = || {
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
    };

    let from_cookie = || {
        req.headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|c| token_pair(c.trim().as_bytes()))
    };

    from_query
        .filter(|t| !t.is_empty())
        .or_else(|| from_header().filter(|t| !t.is_empty()))
        .or_else(|| from_cookie().filter(|t| !t.is_empty()))
}

fn token_pair(input: &[u8]) -> Option<String> {
    form_urlencoded::parse(input)
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

impl FrameSink for WebSocketSink {
    /// UTF-8 payloads go out as text frames, anything else as binary.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let msg = match std::str::from_utf8(data) {
            Ok(text) => Message::Text(text.to_owned().into()),
            Err(_) => Message::Binary(data.to_vec().into()),
        };
        self.inner.send(msg).await.map_err(send_failed)
    }

    async fn close(
        &mut self,
        code: u16,
        reason: &str,
    ) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        match self.inner.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
            }
            Err(e) => return Err(send_failed(e)),
        }
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(send_failed(e)),
        }
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketFrames {
    inner: SplitStream<WsStream>,
}

impl FrameStream for WebSocketFrames {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Inbound::Data(text.as_bytes().to_vec())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound::Data(data.to_vec())));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    return Ok(Some(Inbound::Heartbeat));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(
                    WsError::ConnectionClosed | WsError::AlreadyClosed,
                )) => return Ok(None),
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e,
                        ),
                    ));
                }
            }
        }
    }
}

fn send_failed(e: WsError) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        e,
    ))
}
