//! Collaborator contracts for credentials and session state.
//!
//! The engine never issues or stores credentials itself. It asks an external
//! token provider for a short-lived credential when it needs one, and asks
//! the session collaborator to revalidate itself when the server rejects a
//! credential as expired or invalid.

use std::fmt::Display;

use snafu::prelude::*;

/// What a requested credential will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    /// the `AUTH` handshake after the transport opens
    Handshake,
    /// opportunistic attachment to a `SUBSCRIBE` message
    Subscribe,
}

impl Display for TokenPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Handshake => "auth",
            Self::Subscribe => "subscribe",
        })
    }
}

/// Credential fetch failure.
///
/// Always non-fatal to the engine: a failed fetch downgrades the operation
/// to proceed without a credential.
#[derive(Debug, Snafu)]
#[snafu(display("credential fetch failed: {message}"))]
pub struct TokenError {
    /// human readable reason
    pub message: String,
}

impl TokenError {
    /// build from any displayable reason
    pub fn new<S: Display>(message: S) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// External credential source.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch the current credential for the given purpose. May take
    /// arbitrary time and may fail.
    async fn token(&self, purpose: TokenPurpose) -> Result<String, TokenError>;

    /// Whether a user session is currently active. Checked synchronously
    /// before every handshake and credential attachment.
    fn session_active(&self) -> bool;
}

/// External session validation/refresh.
#[async_trait::async_trait]
pub trait SessionRefresh: Send + Sync {
    /// Ask the session to validate or refresh itself. Returns whether the
    /// session is (now) valid; a valid result re-triggers the handshake.
    async fn revalidate(&self) -> bool;
}

/// Collaborator for public-data consumers: never logged in, never valid.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait::async_trait]
impl TokenProvider for Anonymous {
    async fn token(&self, _purpose: TokenPurpose) -> Result<String, TokenError> {
        Err(TokenError::new("no session"))
    }

    fn session_active(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
impl SessionRefresh for Anonymous {
    async fn revalidate(&self) -> bool {
        false
    }
}
