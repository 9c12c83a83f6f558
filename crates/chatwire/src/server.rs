//! `ChatwireServer` builder and accept loop.
//!
//! This is the entry point for running a chatwire relay. It ties the
//! layers together: transport → session → hub → dispatcher.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use chatwire_hub::{ConnectionConfig, Hub};
use chatwire_protocol::UserId;
use chatwire_session::{Authenticator, CloseReason};
use chatwire_transport::{UpgradeConfig, WebSocketTransport};
use tokio::task::JoinSet;

use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::handler::handle_connection;
use crate::services::{AuditLog, ChannelAccess, MessageStore};
use crate::ChatwireError;

/// Shared server state passed to each connection task.
pub(crate) struct ServerState<Au, A, M, L> {
    pub(crate) hub: Arc<Hub>,
    pub(crate) auth: Au,
    pub(crate) dispatcher: Dispatcher<A, M, L>,
    pub(crate) config: ConnectionConfig,
}

/// Builder for configuring and starting a chatwire server.
///
/// # Example
///
/// ```rust,no_run
/// use chatwire::prelude::*;
///
/// # async fn run() -> Result<(), ChatwireError> {
/// let server = ChatwireServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(
///         StaticTokens::new().with_token("t-1", "u-1", "alice"),
///         InMemoryChannels::new(),
///         InMemoryMessages::new(),
///         TracingAudit::new(),
///     )
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct ChatwireServerBuilder {
    bind_addr: String,
    path: String,
    connection_config: ConnectionConfig,
    dispatch_config: DispatchConfig,
}

impl ChatwireServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path: UpgradeConfig::default().path,
            connection_config: ConnectionConfig::default(),
            dispatch_config: DispatchConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the only path that accepts WebSocket upgrades.
    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    /// Binds the listener and wires the collaborators together.
    pub async fn build<Au, A, M, L>(
        self,
        auth: Au,
        channels: A,
        messages: M,
        audit: L,
    ) -> Result<ChatwireServer<Au, A, M, L>, ChatwireError>
    where
        Au: Authenticator,
        A: ChannelAccess,
        M: MessageStore,
        L: AuditLog,
    {
        let upgrade = UpgradeConfig {
            path: self.path,
            max_frame_size: self.connection_config.max_frame_size,
        };
        let transport = WebSocketTransport::bind(&self.bind_addr, upgrade).await?;

        let hub = Arc::new(Hub::new());
        let dispatcher = Dispatcher::new(Arc::clone(&hub), channels, messages, audit)
            .with_config(self.dispatch_config);

        let state = Arc::new(ServerState {
            hub,
            auth,
            dispatcher,
            config: self.connection_config,
        });

        Ok(ChatwireServer { transport, state })
    }
}

impl Default for ChatwireServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound chatwire server.
///
/// Call [`run()`](Self::run) or [`run_until()`](Self::run_until) to start
/// accepting connections.
pub struct ChatwireServer<Au, A, M, L> {
    transport: WebSocketTransport,
    state: Arc<ServerState<Au, A, M, L>>,
}

impl ChatwireServer<(), (), (), ()> {
    /// Creates a new builder.
    pub fn builder() -> ChatwireServerBuilder {
        ChatwireServerBuilder::new()
    }
}

impl<Au, A, M, L> ChatwireServer<Au, A, M, L>
where
    Au: Authenticator,
    A: ChannelAccess,
    M: MessageStore,
    L: AuditLog,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// The hub, for statistics and administrative actions.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    pub fn dispatcher(&self) -> &Dispatcher<A, M, L> {
        &self.state.dispatcher
    }

    /// A cloneable handle for administrative actions while the server
    /// runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            hub: Arc::clone(&self.state.hub),
        }
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), ChatwireError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes, then closes every
    /// connection and waits (bounded by the write timeout) for their
    /// tasks to finish.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ChatwireError> {
        let addr = self.local_addr().map_err(chatwire_transport::TransportError::AcceptFailed)?;
        tracing::info!(%addr, "chatwire server running");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = self.transport.accept() => match accepted {
                    Ok(pending) => {
                        let state = Arc::clone(&self.state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(pending, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        let closed = self.state.hub.shutdown().await;
        tracing::info!(connections = closed, "shutting down");

        let grace = self.state.config.write_timeout;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "aborting connection tasks");
            tasks.abort_all();
        }
        Ok(())
    }
}

/// Cheap handle to a running server's hub.
#[derive(Clone)]
pub struct ServerHandle {
    hub: Arc<Hub>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Forcibly disconnects a user's live connection.
    pub async fn kick(&self, user_id: &UserId) -> bool {
        match self.hub.find_by_user(user_id).await {
            Some(conn) => self.hub.disconnect(conn.id(), CloseReason::Kicked).await,
            None => false,
        }
    }
}
