use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the call orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Queued,
    Matched,
    Calling,
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Connecting => "connecting",
            Phase::Queued => "queued",
            Phase::Matched => "matched",
            Phase::Calling => "calling",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call (or a matched-but-not-yet-calling room) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCause {
    /// The peer left or the media path died without recovering.
    RemoteLeft,
    /// Our own side failed (timeouts, dead media).
    Disconnect,
    /// A surfaced error, e.g. media acquisition failed.
    Error,
    /// The user asked for another partner.
    FindOther,
}

impl EndCause {
    /// Whether the `end` relay to the peer is skipped for this cause. The
    /// peer is already gone when it left, so there is no one to tell.
    pub fn suppresses_end_relay(self) -> bool {
        self == EndCause::RemoteLeft
    }
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndCause::RemoteLeft => "remote_left",
            EndCause::Disconnect => "disconnect",
            EndCause::Error => "error",
            EndCause::FindOther => "find_other",
        };
        f.write_str(s)
    }
}

/// Which side creates the SDP offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator { Role::Caller } else { Role::Callee }
    }

    pub fn is_caller(self) -> bool {
        self == Role::Caller
    }
}

/// Peer connection state as reported by the media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States that arm the connectivity debounce while calling.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

/// Connection status of the signaling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalStatus {
    Disconnected,
    Connecting,
    AwaitingRegistration,
    Registered,
    /// Manually closed. No reconnection happens from here.
    Closed,
}

/// Queue/room membership while registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Membership {
    Idle,
    Queued,
    InRoom(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_departed_peer_skips_the_end_relay() {
        assert!(EndCause::RemoteLeft.suppresses_end_relay());
        for cause in [EndCause::Disconnect, EndCause::Error, EndCause::FindOther] {
            assert!(!cause.suppresses_end_relay(), "{cause}");
        }
    }

    #[test]
    fn initiator_flag_picks_the_role() {
        assert_eq!(Role::from_initiator(true), Role::Caller);
        assert!(!Role::from_initiator(false).is_caller());
    }

    #[test]
    fn down_states() {
        assert!(ConnectivityState::Failed.is_down());
        assert!(!ConnectivityState::Connecting.is_down());
        assert_eq!(Phase::Calling.to_string(), "calling");
    }
}
