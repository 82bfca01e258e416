//! Engine configuration.

use std::time::Duration;

use snafu::prelude::*;
use url::Url;

use crate::error::error;

/// Probe the peer this often to keep intermediaries from idling the
/// connection out (typical proxy idle timeouts sit around 30-60s).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long a probe may go unanswered before it counts as missed.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Missed probes before the connection is declared dead.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// First reconnect delay.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(3);

/// Reconnect delay plateau once backoff growth stops.
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(15);

/// Window for coalescing a burst of subscribe calls into one wire message.
pub const DEFAULT_SUBSCRIBE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Engine tunables plus the websocket endpoint.
///
/// All fields are public; the constructors fill in the defaults above.
#[derive(Debug, Clone)]
pub struct Config {
    /// websocket endpoint url (`ws` or `wss` scheme)
    pub endpoint: Url,
    /// liveness probe interval
    pub heartbeat_interval: Duration,
    /// liveness probe reply deadline
    pub heartbeat_timeout: Duration,
    /// missed probe threshold that forces a reconnect
    pub max_missed_heartbeats: u32,
    /// first reconnect delay
    pub reconnect_base: Duration,
    /// reconnect delay plateau
    pub reconnect_cap: Duration,
    /// subscribe coalescing window
    pub subscribe_debounce: Duration,
}

impl Config {
    /// Build a config from a full websocket endpoint url.
    pub fn new<S: AsRef<str> + ?Sized>(endpoint: &S) -> crate::Result<Self> {
        let endpoint = endpoint.as_ref();

        let url = Url::parse(endpoint).context(error::InvalidEndpoint { url: endpoint })?;

        ensure!(
            url.scheme() == "ws" || url.scheme() == "wss",
            error::UnsupportedScheme {
                url: endpoint,
                scheme: url.scheme(),
            }
        );

        Ok(Self::with_endpoint(url))
    }

    /// Build a config from the hosting page's origin plus the well-known
    /// endpoint path, mapping the scheme automatically: `https` origins get
    /// `wss`, `http` origins get `ws`.
    pub fn for_origin<S: AsRef<str> + ?Sized>(origin: &S, path: &str) -> crate::Result<Self> {
        let origin = origin.as_ref();

        let mut url = Url::parse(origin).context(error::InvalidEndpoint { url: origin })?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return error::UnsupportedScheme {
                    url: origin,
                    scheme: other,
                }
                .fail()
            }
        };

        // set_scheme only rejects invalid schemes, both are valid here
        let _ = url.set_scheme(scheme);
        url.set_path(path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self::with_endpoint(url))
    }

    fn with_endpoint(endpoint: Url) -> Self {
        Self {
            endpoint,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
            subscribe_debounce: DEFAULT_SUBSCRIBE_DEBOUNCE,
        }
    }
}
