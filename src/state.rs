//! Connection lifecycle states.

use std::fmt::Display;

/// Connection lifecycle state, published to consumers through a watch
/// channel.
///
/// No state is terminal: `Disconnected` and `Error` both lead back to
/// `Connecting` through the reconnect scheduler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// no transport, nothing scheduled
    #[default]
    Disconnected,
    /// transport handshake in progress
    Connecting,
    /// transport open, not authenticated
    Connected,
    /// credential sent, waiting for the server acknowledgment
    Authenticating,
    /// server acknowledged the credential
    Authenticated,
    /// transport lost, reconnect timer pending
    Reconnecting,
    /// transport failed abnormally (reconnect still follows)
    Error,
}

impl ConnectionState {
    /// true if the transport is open and frames can be sent
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticating | Self::Authenticated
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
