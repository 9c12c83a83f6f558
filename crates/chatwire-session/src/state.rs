//! Connection lifecycle state machine.

use std::fmt;

/// Where a connection is in its lifecycle.
///
/// ```text
/// Connecting ──(token ok)──→ Authenticated ──(registered)──→ Active
///      │                          │                            │
///      └──────────────(fault / close)──────────────────────────┘
///                                 ▼
///                              Closing ──(loops done)──→ Closed
/// ```
///
/// `Closed` is terminal. Every state except `Closed` may move to
/// `Closing`; nothing moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade in progress, identity unknown.
    Connecting,
    /// Identity confirmed, not yet registered with the hub.
    Authenticated,
    /// Registered; receives broadcasts.
    Active,
    /// Shutting down; loops are winding down.
    Closing,
    /// Terminal. All operations are no-ops.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Active)
                | (Connecting | Authenticated | Active, Closing)
                | (Closing, Closed)
        )
    }

    /// `Authenticated` or `Active`: the connection may still carry frames.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Authenticated | Self::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a connection moved to `Closing`. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or hung up.
    PeerClosed,
    /// Reading failed (socket error, oversized frame).
    ReadFailed,
    /// Nothing arrived within the read-inactivity deadline.
    ReadTimeout,
    /// Writing failed.
    WriteFailed,
    /// A write did not complete within the write deadline.
    WriteTimeout,
    /// The outbound queue was full when a frame had to be enqueued.
    SlowConsumer,
    /// A newer connection for the same user took over.
    Replaced,
    /// Forced off by an administrative action (ban, kick).
    Kicked,
    /// The server is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// The WebSocket close code sent to the peer (RFC 6455 §7.4.1).
    pub fn close_code(self) -> u16 {
        match self {
            Self::PeerClosed => 1000,
            Self::ReadTimeout | Self::ServerShutdown => 1001,
            Self::ReadFailed => 1002,
            Self::Replaced | Self::Kicked => 1008,
            Self::WriteFailed | Self::WriteTimeout => 1011,
            Self::SlowConsumer => 1013,
        }
    }

    /// `true` for transport faults, as opposed to deliberate closes.
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::ReadFailed
                | Self::ReadTimeout
                | Self::WriteFailed
                | Self::WriteTimeout
                | Self::SlowConsumer
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::ReadFailed => "read failed",
            Self::ReadTimeout => "read timed out",
            Self::WriteFailed => "write failed",
            Self::WriteTimeout => "write timed out",
            Self::SlowConsumer => "slow consumer",
            Self::Replaced => "replaced by a newer connection",
            Self::Kicked => "disconnected by an administrator",
            Self::ServerShutdown => "server shutting down",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions_are_legal() {
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Active));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
    }

    #[test]
    fn test_closing_reachable_from_every_live_state() {
        for state in [Connecting, Authenticated, Active] {
            assert!(state.can_transition_to(Closing), "{state} -> closing");
        }
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        assert!(!Active.can_transition_to(Authenticated));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Closing.can_transition_to(Active));
        assert!(!Authenticated.can_transition_to(Closed));
    }

    #[test]
    fn test_closed_has_no_transitions() {
        for next in [Connecting, Authenticated, Active, Closing, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_is_open() {
        assert!(Authenticated.is_open());
        assert!(Active.is_open());
        assert!(!Connecting.is_open());
        assert!(!Closing.is_open());
        assert!(!Closed.is_open());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::PeerClosed.close_code(), 1000);
        assert_eq!(CloseReason::ServerShutdown.close_code(), 1001);
        assert_eq!(CloseReason::SlowConsumer.close_code(), 1013);
        assert_eq!(CloseReason::Replaced.close_code(), 1008);
    }

    #[test]
    fn test_is_fault() {
        assert!(CloseReason::SlowConsumer.is_fault());
        assert!(CloseReason::WriteTimeout.is_fault());
        assert!(!CloseReason::PeerClosed.is_fault());
        assert!(!CloseReason::ServerShutdown.is_fault());
    }
}
