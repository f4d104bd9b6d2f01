//! Session state machine and observable status

use std::fmt;

/// Connection state of a live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session; `start` is accepted
    #[default]
    Disconnected,
    /// Devices acquired, handshake in flight
    Connecting,
    /// Audio is flowing in both directions
    Connected,
    /// The last attempt failed; `start` is accepted
    Error,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected | Self::Error, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected | Self::Error)
                | (Self::Connected | Self::Error, Self::Disconnected)
                | (Self::Connected, Self::Error)
        )
    }

    /// Whether `start` would begin a new session from this state
    #[must_use]
    pub const fn accepts_start(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of everything a caller can observe about a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Connection state
    pub state: SessionState,
    /// The local user is speaking
    pub user_speaking: bool,
    /// Response audio is scheduled or playing
    pub remote_speaking: bool,
    /// User-facing description of the last failure
    pub last_error: Option<String>,
    /// An automatic reconnect is scheduled
    pub reconnecting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 4] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Error,
    ];

    #[test]
    fn legal_edges() {
        use SessionState::{Connected, Connecting, Disconnected, Error};

        let legal = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Disconnected),
            (Connecting, Error),
            (Connected, Disconnected),
            (Connected, Error),
            (Error, Disconnected),
            (Error, Connecting),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn start_only_from_idle_states() {
        assert!(SessionState::Disconnected.accepts_start());
        assert!(SessionState::Error.accepts_start());
        assert!(!SessionState::Connecting.accepts_start());
        assert!(!SessionState::Connected.accepts_start());
    }

    #[test]
    fn default_status_is_idle() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(!status.user_speaking);
        assert!(!status.remote_speaking);
        assert!(status.last_error.is_none());
        assert!(!status.reconnecting);
    }
}
