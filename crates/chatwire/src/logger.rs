//! Logging setup for the server binary.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global `tracing` subscriber.
///
/// `RUST_LOG` overrides everything. Without it, every chatwire crate and
/// the binary itself log at `default_level`.
///
/// ```no_run
/// chatwire::logger::setup_logger("chatwire-server", "info");
/// ```
pub fn setup_logger(binary_name: &str, default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            default_directives(binary_name, default_level).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_directives(binary_name: &str, level: &str) -> String {
    [
        "chatwire",
        "chatwire_transport",
        "chatwire_hub",
        binary_name,
    ]
    .iter()
    .map(|target| format!("{}={level}", target.replace('-', "_")))
    .collect::<Vec<_>>()
    .join(",")
}
