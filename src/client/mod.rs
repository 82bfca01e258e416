//! Connection controller: the public handle and its background worker.
//!
//! The worker task exclusively owns the transport, the subscription ledger
//! and the listener registry. Handles are cheap clones that push commands
//! onto the worker's queue; every command, inbound frame and timer is
//! processed on one task, so state never needs a lock.

mod command;
pub(crate) mod transport;
mod worker;

pub use transport::{ConnectError, Connector, WsConnector};

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    auth::{SessionRefresh, TokenProvider},
    config::Config,
    ledger::ConsumerId,
    listener::Listener,
    state::ConnectionState,
    wire::{Envelope, Topic},
};
use command::Command;
use worker::Worker;

/// Handle to the shared realtime connection.
///
/// Construct one at application start with [`Client::spawn`] and clone it
/// into every consumer. Dropping the last handle stops the worker and closes
/// the transport.
#[derive(Debug, Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Spawn the connection worker with the production websocket connector.
    ///
    /// The worker starts idle; call [`connect`](Self::connect) to open the
    /// transport.
    pub fn spawn(
        config: Config,
        tokens: Arc<dyn TokenProvider>,
        session: Arc<dyn SessionRefresh>,
    ) -> Self {
        Self::spawn_with_connector(WsConnector, config, tokens, session)
    }

    /// Spawn the connection worker over a custom [`Connector`].
    pub fn spawn_with_connector<C: Connector>(
        connector: C,
        config: Config,
        tokens: Arc<dyn TokenProvider>,
        session: Arc<dyn SessionRefresh>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker::new(connector, config, tokens, session, cmd_rx, state_tx);
        tokio::spawn(worker.run());

        Self { cmd_tx, state_rx }
    }

    fn command(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            log::debug!("Connection worker already stopped, command dropped");
        }
    }

    async fn roundtrip<T: Default>(&self, reply: oneshot::Receiver<T>) -> T {
        reply.await.unwrap_or_default()
    }

    /// Open the connection. Idempotent: a no-op while already connecting or
    /// connected; cancels a pending reconnect timer and retries now.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Deliberately close the connection without scheduling a reconnect.
    /// A later [`connect`](Self::connect) starts over.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Host environment hint (tab became visible again, user interacted
    /// while disconnected): opportunistically retry the idempotent connect.
    pub fn hint_reconnect(&self) {
        log::trace!("Host activity hint, retrying connect");
        self.command(Command::Connect);
    }

    /// The external session just became active: re-run the authentication
    /// handshake if the transport is open.
    pub fn notify_login(&self) {
        self.command(Command::NotifyLogin);
    }

    /// Send a raw envelope. Returns false if the transport is not open;
    /// delivery is best-effort either way, callers needing guarantees must
    /// wait for an application-level acknowledgment.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { envelope, reply });
        self.roundtrip(rx).await
    }

    /// Subscribe the consumer to a set of topics.
    ///
    /// Accepted requests return true: deferred while offline, coalesced with
    /// other recent requests while online, and a no-op when every topic is
    /// already subscribed. Each topic goes on the wire at most once no
    /// matter how many consumers ask for it.
    pub async fn subscribe(&self, topics: Vec<Topic>, consumer: Option<ConsumerId>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            topics,
            consumer: consumer.unwrap_or_else(ConsumerId::anonymous),
            reply,
        });
        self.roundtrip(rx).await
    }

    /// Drop the consumer's interest in a set of topics. Topics with no
    /// owner left are unsubscribed on the wire; bookkeeping still updates
    /// while offline, without wire traffic.
    ///
    /// `None` releases the shared anonymous identity, symmetric with
    /// [`subscribe`](Self::subscribe): other consumers' interests are never
    /// affected.
    pub async fn unsubscribe(&self, topics: Vec<Topic>, consumer: Option<ConsumerId>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unsubscribe {
            topics,
            consumer: consumer.unwrap_or_else(ConsumerId::anonymous),
            reply,
        });
        self.roundtrip(rx).await
    }

    /// Issue a generic query on a topic. A correlation id is generated and
    /// attached; the response arrives through listeners.
    pub async fn request(
        &self,
        topic: Topic,
        action: &str,
        params: Map<String, Value>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            topic,
            action: action.to_string(),
            params,
            reply,
        });
        self.roundtrip(rx).await
    }

    /// Register a listener for the given message types, optionally narrowed
    /// to a topic set. Re-registering an id replaces the prior record.
    ///
    /// The returned guard unregisters on drop (or explicitly through
    /// [`ListenerGuard::unregister`]).
    pub async fn register_listener<L, I, S>(
        &self,
        id: &str,
        types: I,
        topics: Option<Vec<Topic>>,
        listener: L,
    ) -> ListenerGuard
    where
        L: Listener + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RegisterListener {
            id: id.to_string(),
            types: types.into_iter().map(Into::into).collect::<HashSet<_>>(),
            topics: topics.map(|ts| ts.into_iter().collect()),
            listener: Arc::new(listener),
            reply,
        });

        ListenerGuard {
            id: id.to_string(),
            generation: self.roundtrip(rx).await,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Release everything a consumer registered interest in. The teardown
    /// call for an unmounting component, so subscriptions do not leak.
    pub fn cleanup_consumer(&self, consumer: ConsumerId) {
        self.command(Command::CleanupConsumer { consumer });
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel for state transitions, for consumers that react to
    /// reconnects (and re-request full state after one).
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The most recent connection error, if the engine is currently in (or
    /// recovering from) a failed state.
    pub async fn connection_error(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::QueryError { reply });
        self.roundtrip(rx).await
    }
}

/// Unregistration token for a registered listener.
///
/// Dropping the guard removes the listener. Guards are generation-tagged:
/// a stale guard kept across a re-registration of the same id will not
/// remove the replacement.
#[derive(Debug)]
pub struct ListenerGuard {
    id: String,
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ListenerGuard {
    /// the listener id this guard controls
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the listener now. Equivalent to dropping the guard.
    pub fn unregister(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::UnregisterListener {
            id: std::mem::take(&mut self.id),
            generation: self.generation,
        });
    }
}
