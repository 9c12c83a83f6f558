//! Per-connection limits and deadlines.

use std::time::Duration;

/// Settings shared by every connection's loops.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound queue. A full queue marks
    /// the connection as a slow consumer and closes it.
    pub outbound_capacity: usize,

    /// Read-inactivity deadline: if nothing (data or control frame)
    /// arrives for this long the peer is considered dead.
    pub pong_timeout: Duration,

    /// Deadline for a single socket write.
    pub write_timeout: Duration,

    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,

    /// Deadline for the HTTP upgrade plus token validation. A client that
    /// connects and sends nothing is dropped once it passes.
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    /// How often the outbound loop emits a `ping` envelope: 9/10 of the
    /// pong timeout, so a healthy peer always answers before its
    /// deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_timeout * 9 / 10
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_size: 512,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
