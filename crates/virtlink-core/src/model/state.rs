//! Connection state machine.

use serde::{Deserialize, Serialize};

/// State of a single backend endpoint.
///
/// Transitions:
/// - Disconnected -> Connecting (`try_connect`)
/// - Connecting -> Connected (connect work succeeded)
/// - Connecting -> Disconnected (connect work failed; `ConnectionFailed` is emitted)
/// - Connected -> Disconnected (`disconnect`, failed liveness check, backend close notification)
///
/// There is no retained "failed" state; a failure is an event, not a state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// `try_connect` only acts from here.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    /// The backend handle exists exactly in this state.
    pub fn has_handle(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
