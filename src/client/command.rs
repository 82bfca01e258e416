use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::{
    ledger::ConsumerId,
    listener::Listener,
    wire::{Envelope, Topic},
};

/// Everything a handle can ask the worker to do.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        topics: Vec<Topic>,
        consumer: ConsumerId,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topics: Vec<Topic>,
        consumer: ConsumerId,
        reply: oneshot::Sender<bool>,
    },
    Request {
        topic: Topic,
        action: String,
        params: Map<String, Value>,
        reply: oneshot::Sender<bool>,
    },
    RegisterListener {
        id: String,
        types: HashSet<String>,
        topics: Option<HashSet<Topic>>,
        listener: Arc<dyn Listener>,
        reply: oneshot::Sender<u64>,
    },
    UnregisterListener {
        id: String,
        generation: u64,
    },
    CleanupConsumer {
        consumer: ConsumerId,
    },
    NotifyLogin,
    QueryError {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Results posted back by the worker's own spawned side-tasks (token
/// fetches, session revalidation).
///
/// These travel on a separate channel whose sender the worker owns, so the
/// handle-facing command channel still closes when the last handle drops.
pub(crate) enum Postback {
    SubscribeToken {
        topics: Vec<Topic>,
        token: Option<String>,
    },
    HandshakeToken {
        token: Option<String>,
    },
    SessionRevalidated {
        valid: bool,
    },
}
