//! Wire envelope types for the realtime protocol.

mod stream;

pub use stream::{EnvelopeStream, WireError};

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message type tags used by the engine itself. Everything else on the
/// `type` field belongs to consumers.
pub mod kind {
    /// minimal liveness probe, client -> server
    pub const PING: &str = "ping";
    /// minimal liveness reply, server -> client
    pub const PONG: &str = "pong";
    /// structured consumer query, client -> server
    pub const REQUEST: &str = "REQUEST";
    /// structured query reply, server -> client
    pub const RESPONSE: &str = "RESPONSE";
    /// topic subscription, client -> server
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    /// topic release, client -> server
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    /// subscription acknowledgment, server -> client
    pub const SUBSCRIBED: &str = "SUBSCRIBED";
    /// release acknowledgment, server -> client
    pub const UNSUBSCRIBED: &str = "UNSUBSCRIBED";
    /// credential upgrade, client -> server
    pub const AUTH: &str = "AUTH";
    /// credential accepted, server -> client
    pub const AUTH_ACK: &str = "AUTH_ACK";
    /// credential rejected, server -> client
    pub const AUTH_ERROR: &str = "AUTH_ERROR";
    /// server-originated heartbeat, forwarded to listeners untouched
    pub const HEARTBEAT: &str = "HEARTBEAT";
    /// globally relevant message, bypasses listener filtering
    pub const SYSTEM: &str = "SYSTEM";
}

/// Topic used for protocol-control requests (liveness probes).
pub const SYSTEM_TOPIC: &str = "system";

/// Auth error reason: no credential was attached.
pub const REASON_TOKEN_MISSING: &str = "token_missing";
/// Auth error reason: the credential has expired.
pub const REASON_TOKEN_EXPIRED: &str = "token_expired";
/// Auth error reason: the credential was rejected outright.
pub const REASON_TOKEN_INVALID: &str = "token_invalid";

/// An opaque topic name identifying one data stream.
///
/// The engine assumes no hierarchy; `token:price:<address>` is just a string
/// to this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// topic name as a str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The JSON wire envelope.
///
/// Every field but `type` is optional; unknown fields are kept in `extra` so
/// consumer payload shapes survive a round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// message classification
    #[serde(rename = "type", default)]
    pub kind: String,

    /// data stream this message belongs to, absent for most control messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,

    /// request/response correlation verb
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// opaque payload, owned by consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// topic batch for subscribe/unsubscribe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<Topic>>,

    /// credential, attached opportunistically
    #[serde(rename = "authToken", default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// request/response correlation id
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// status code, used on auth errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    /// failure reason, used on auth errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// client wall-clock millis, attached to minimal pings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// any fields this layer does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Envelope {
    /// Construct an empty envelope of the given type.
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// `SUBSCRIBE` for a topic batch, with an optional credential attached.
    pub fn subscribe(topics: Vec<Topic>, auth_token: Option<String>) -> Self {
        Self {
            topics: Some(topics),
            auth_token,
            ..Self::new(kind::SUBSCRIBE)
        }
    }

    /// `UNSUBSCRIBE` for a topic batch.
    pub fn unsubscribe(topics: Vec<Topic>) -> Self {
        Self {
            topics: Some(topics),
            ..Self::new(kind::UNSUBSCRIBE)
        }
    }

    /// `AUTH` carrying the session credential.
    pub fn auth<S: Into<String>>(token: S) -> Self {
        Self {
            auth_token: Some(token.into()),
            ..Self::new(kind::AUTH)
        }
    }

    /// Minimal liveness probe shape.
    pub fn ping() -> Self {
        Self {
            timestamp: Some(now_millis()),
            ..Self::new(kind::PING)
        }
    }

    /// Structured liveness probe shape, for intermediaries that only pass
    /// request/response traffic through.
    pub fn system_ping<S: Into<String>>(request_id: S) -> Self {
        Self {
            topic: Some(Topic::from(SYSTEM_TOPIC)),
            action: Some(kind::PING.to_string()),
            request_id: Some(request_id.into()),
            ..Self::new(kind::REQUEST)
        }
    }

    /// Generic consumer query.
    pub fn request<A: Into<String>, R: Into<String>>(
        topic: Topic,
        action: A,
        request_id: R,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            topic: Some(topic),
            action: Some(action.into()),
            request_id: Some(request_id.into()),
            extra: params,
            ..Self::new(kind::REQUEST)
        }
    }

    /// Recognize a liveness reply in any of its legitimate wire shapes:
    /// a bare `pong` type, a `pong` action, or a `RESPONSE` to the
    /// structured system ping.
    pub fn is_liveness_reply(&self) -> bool {
        if self.kind.eq_ignore_ascii_case(kind::PONG) {
            return true;
        }

        if matches!(&self.action, Some(action) if action.eq_ignore_ascii_case(kind::PONG)) {
            return true;
        }

        self.kind.eq_ignore_ascii_case(kind::RESPONSE)
            && matches!(&self.topic, Some(topic) if topic.as_str() == SYSTEM_TOPIC)
            && matches!(&self.action, Some(action) if action.eq_ignore_ascii_case(kind::PING))
    }

    /// true for the distinguished globally-relevant message type
    pub fn is_system(&self) -> bool {
        self.kind.eq_ignore_ascii_case(kind::SYSTEM)
    }

    pub(crate) fn classify(self) -> Inbound {
        if self.is_liveness_reply() {
            return Inbound::LivenessReply;
        }

        if self.kind.eq_ignore_ascii_case(kind::AUTH_ACK) {
            return Inbound::AuthAck;
        }

        if self.kind.eq_ignore_ascii_case(kind::AUTH_ERROR) {
            let failure = AuthFailure::from_reason(self.reason.as_deref());
            return Inbound::AuthError {
                failure,
                envelope: self,
            };
        }

        if self.kind.eq_ignore_ascii_case(kind::SUBSCRIBED)
            || self.kind.eq_ignore_ascii_case(kind::UNSUBSCRIBED)
        {
            return Inbound::SubscriptionAck(self);
        }

        // server heartbeats fall through on purpose: forwarded to listeners,
        // never counted as liveness replies
        Inbound::Data(self)
    }
}

/// Inbound message after protocol-control pattern matching.
#[derive(Debug, EnumAsInner)]
pub(crate) enum Inbound {
    /// liveness reply in one of its wire shapes
    LivenessReply,
    /// credential accepted
    AuthAck,
    /// credential rejected
    AuthError {
        failure: AuthFailure,
        envelope: Envelope,
    },
    /// subscribe/unsubscribe acknowledgment, informational only
    SubscriptionAck(Envelope),
    /// anything else, handed to the listener registry
    Data(Envelope),
}

/// Classified authentication failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// no credential was attached
    TokenMissing,
    /// credential has expired
    TokenExpired,
    /// credential was rejected
    TokenInvalid,
    /// unrecognized reason
    Other,
}

impl AuthFailure {
    /// map a wire reason string to a failure class
    pub fn from_reason(reason: Option<&str>) -> Self {
        match reason {
            Some(REASON_TOKEN_MISSING) => Self::TokenMissing,
            Some(REASON_TOKEN_EXPIRED) => Self::TokenExpired,
            Some(REASON_TOKEN_INVALID) => Self::TokenInvalid,
            _ => Self::Other,
        }
    }

    /// expired/invalid credentials escalate to the session collaborator
    pub fn should_revalidate(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::TokenInvalid)
    }
}
