//! Pure connection lifecycle state machine
//!
//! `Idle -> Connecting -> Connected <-> Disconnected -> Closed`. Closed is
//! terminal. Transitions are computed by [`next_state`] and never performed
//! in place, so both the registry and device listeners share one table.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Transport lost; may come back within the grace window
    Disconnected,
    Closed,
}

/// Lifecycle inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTrigger {
    /// Transport started authenticating the session
    Authenticate,
    /// Authentication succeeded (first time or within the grace window)
    Authenticated,
    /// Transport session went away
    TransportLost,
    /// Grace window elapsed without re-authentication
    GraceExpired,
    /// Explicit close, supersession or deprovisioning
    Close,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Next state for `trigger`, or `None` if the transition is not allowed
pub fn next_state(state: ConnectionState, trigger: ConnectionTrigger) -> Option<ConnectionState> {
    use ConnectionState::*;
    use ConnectionTrigger::*;

    match (state, trigger) {
        (Closed, _) => None,
        (_, Close) => Some(Closed),
        (Idle, Authenticate) => Some(Connecting),
        (Idle, Authenticated) => Some(Connected),
        (Connecting, Authenticated) => Some(Connected),
        (Connecting, TransportLost) => Some(Closed),
        (Connected, TransportLost) => Some(Disconnected),
        (Disconnected, Authenticated) => Some(Connected),
        (Disconnected, GraceExpired) => Some(Closed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::ConnectionTrigger::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = Idle;
        for trigger in [Authenticate, Authenticated, TransportLost, GraceExpired] {
            state = next_state(state, trigger).unwrap();
        }
        assert_eq!(state, Closed);
    }

    #[test]
    fn test_reauthentication_within_grace() {
        assert_eq!(next_state(Disconnected, Authenticated), Some(Connected));
        assert_eq!(next_state(Connected, TransportLost), Some(Disconnected));
    }

    #[test]
    fn test_closed_is_terminal() {
        for trigger in [Authenticate, Authenticated, TransportLost, GraceExpired, Close] {
            assert_eq!(next_state(Closed, trigger), None, "{trigger:?}");
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(next_state(Connected, Authenticate), None);
        assert_eq!(next_state(Connected, GraceExpired), None);
        assert_eq!(next_state(Idle, TransportLost), None);
    }

    #[test]
    fn test_close_from_any_live_state() {
        for state in [Idle, Connecting, Connected, Disconnected] {
            assert_eq!(next_state(state, Close), Some(Closed));
        }
    }
}
