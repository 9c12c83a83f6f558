//! Demo chatwire server with in-memory collaborators.
//!
//! Seeds two channels (`general`, `random`) and three users whose tokens
//! are `alice-token`, `bob-token` and `carol-token`.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin chatwire-server
//! cargo run --bin chatwire-server -- --host 0.0.0.0 --port 3000 --log-level debug
//! ```
//! and connect to `ws://127.0.0.1:8080/ws?token=alice-token`.

use std::time::Duration;

use chatwire::logger::setup_logger;
use chatwire::prelude::*;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chatwire-server")]
#[command(about = "Real-time chat relay over WebSocket", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// Path that accepts WebSocket upgrades
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Default log level when RUST_LOG is not set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Outbound queue capacity per connection
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// Seconds of silence before a peer is considered dead
    #[arg(long, default_value = "60")]
    pong_timeout: u64,
}

const DEMO_USERS: [(&str, &str, &str); 3] = [
    ("alice-token", "u-alice", "alice"),
    ("bob-token", "u-bob", "bob"),
    ("carol-token", "u-carol", "carol"),
];

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logger(env!("CARGO_BIN_NAME"), &args.log_level);

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ChatwireError> {
    let mut tokens = StaticTokens::new();
    let channels = InMemoryChannels::new();
    for name in ["general", "random"] {
        let channel_id = ChannelId::from(name);
        channels.create(channel_id.clone()).await;
        for (_, user_id, _) in DEMO_USERS {
            if let Err(e) = channels.add_member(&channel_id, user_id).await {
                tracing::warn!(%channel_id, error = %e, "failed to seed member");
            }
        }
    }
    for (token, user_id, username) in DEMO_USERS {
        tokens = tokens.with_token(token, user_id, username);
    }

    let connection_config = ConnectionConfig {
        outbound_capacity: args.queue_capacity,
        pong_timeout: Duration::from_secs(args.pong_timeout),
        ..ConnectionConfig::default()
    };

    let server = ChatwireServer::builder()
        .bind(&format!("{}:{}", args.host, args.port))
        .path(&args.path)
        .connection_config(connection_config)
        .build(tokens, channels, InMemoryMessages::new(), TracingAudit::new())
        .await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("ctrl-c received");
        })
        .await
}
