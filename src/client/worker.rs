use std::sync::Arc;

use futures_util::{future, FutureExt, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{
    command::{Command, Postback},
    transport::Connector,
};
use crate::{
    auth::{SessionRefresh, TokenProvider, TokenPurpose},
    backoff::Backoff,
    config::Config,
    ledger::{ConsumerId, Ledger},
    listener::Registry,
    state::ConnectionState,
    wire::{Envelope, Inbound, Topic, WireError},
};

fn maybe_sleep(tick: Option<Instant>) -> future::BoxFuture<'static, ()> {
    match tick {
        Some(tick) => tokio::time::sleep_until(tick).boxed(),
        None => future::pending().boxed(),
    }
}

async fn next_or_pending<S>(transport: Option<&mut S>) -> Option<Result<Envelope, WireError>>
where
    S: Stream<Item = Result<Envelope, WireError>> + Unpin,
{
    match transport {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

/// The connection worker: one task that owns the transport handle, the
/// subscription ledger and the listener registry, and serializes every
/// command, timer and inbound frame.
pub(crate) struct Worker<C: Connector> {
    connector: C,
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    session: Arc<dyn SessionRefresh>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    /// side-task results come back on their own channel, so the command
    /// channel closes (and the worker exits) when the last handle drops
    post_tx: mpsc::UnboundedSender<Postback>,
    post_rx: mpsc::UnboundedReceiver<Postback>,
    state_tx: watch::Sender<ConnectionState>,

    state: ConnectionState,
    last_error: Option<String>,
    transport: Option<C::Transport>,
    ledger: Ledger,
    registry: Registry,
    backoff: Backoff,

    missed_heartbeats: u32,
    handshake_in_flight: bool,
    request_seq: u64,

    // single-instance timers, None = not armed
    next_probe: Option<Instant>,
    probe_deadline: Option<Instant>,
    debounce_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        connector: C,
        config: Config,
        tokens: Arc<dyn TokenProvider>,
        session: Arc<dyn SessionRefresh>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect_base, config.reconnect_cap);
        let (post_tx, post_rx) = mpsc::unbounded_channel();

        Self {
            connector,
            config,
            tokens,
            session,
            cmd_rx,
            post_tx,
            post_rx,
            state_tx,
            state: ConnectionState::Disconnected,
            last_error: None,
            transport: None,
            ledger: Ledger::default(),
            registry: Registry::default(),
            backoff,
            missed_heartbeats: 0,
            handshake_in_flight: false,
            request_seq: 0,
            next_probe: None,
            probe_deadline: None,
            debounce_deadline: None,
            reconnect_at: None,
        }
    }

    pub async fn run(mut self) {
        log::debug!("Connection worker start");

        loop {
            let probe_clock = maybe_sleep(self.next_probe);
            let deadline_clock = maybe_sleep(self.probe_deadline);
            let debounce_clock = maybe_sleep(self.debounce_deadline);
            let reconnect_clock = maybe_sleep(self.reconnect_at);

            tokio::select! {
                biased;

                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            log::debug!("All handles dropped, worker stop");
                            if let Some(mut transport) = self.transport.take() {
                                let _ = transport.close().await;
                            }
                            break;
                        }
                    }
                }

                postback = self.post_rx.recv() => {
                    // the worker owns a sender, recv never yields None
                    if let Some(postback) = postback {
                        self.handle_postback(postback).await;
                    }
                }

                frame = next_or_pending(self.transport.as_mut()) => {
                    self.handle_frame(frame);
                }

                _ = deadline_clock => self.on_probe_deadline(),

                _ = probe_clock => self.send_probe().await,

                _ = debounce_clock => self.on_debounce().await,

                _ = reconnect_clock => {
                    self.reconnect_at = None;
                    log::info!("Reconnect timer fired, attempt {}", self.backoff.attempt());
                    self.do_connect().await;
                }
            }
        }
    }

    // ===== commands =====

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.do_connect().await,
            Command::Disconnect => self.handle_disconnect().await,
            Command::Send { envelope, reply } => {
                let sent = self.send_envelope(envelope).await;
                let _ = reply.send(sent);
            }
            Command::Subscribe {
                topics,
                consumer,
                reply,
            } => {
                let accepted = self.handle_subscribe(topics, consumer);
                let _ = reply.send(accepted);
            }
            Command::Unsubscribe {
                topics,
                consumer,
                reply,
            } => {
                let done = self.handle_unsubscribe(topics, consumer).await;
                let _ = reply.send(done);
            }
            Command::Request {
                topic,
                action,
                params,
                reply,
            } => {
                let request_id = self.next_request_id();
                let sent = self
                    .send_envelope(Envelope::request(topic, action, request_id, params))
                    .await;
                let _ = reply.send(sent);
            }
            Command::RegisterListener {
                id,
                types,
                topics,
                listener,
                reply,
            } => {
                let generation = self.registry.register(id, types, topics, listener);
                let _ = reply.send(generation);
            }
            Command::UnregisterListener { id, generation } => {
                self.registry.unregister(&id, generation);
            }
            Command::CleanupConsumer { consumer } => {
                let topics = self.ledger.topics_owned_by(&consumer);
                if !topics.is_empty() {
                    log::debug!("Consumer {consumer} cleanup, releasing {} topic(s)", topics.len());
                    self.handle_unsubscribe(topics, consumer).await;
                }
            }
            Command::NotifyLogin => {
                if self.state.is_open() && self.tokens.session_active() {
                    self.begin_handshake();
                }
            }
            Command::QueryError { reply } => {
                let _ = reply.send(self.last_error.clone());
            }
        }
    }

    async fn handle_postback(&mut self, postback: Postback) {
        match postback {
            Postback::SubscribeToken { topics, token } => {
                // an async gap just ended, check the topics are still wanted
                let topics = self.ledger.revalidate(topics);
                if !topics.is_empty() && self.state.is_open() {
                    self.send_subscribe(topics, token).await;
                }
            }
            Postback::HandshakeToken { token } => self.on_handshake_token(token).await,
            Postback::SessionRevalidated { valid } => {
                if valid && self.state.is_open() && self.tokens.session_active() {
                    log::debug!("Session revalidated, retrying handshake");
                    self.begin_handshake();
                }
            }
        }
    }

    // ===== connection lifecycle =====

    async fn do_connect(&mut self) {
        if self.state == ConnectionState::Connecting || self.state.is_open() {
            log::trace!("Connect is a no-op in state {}", self.state);
            return;
        }

        // discard a stale non-open handle and any pending reconnect timer
        self.transport = None;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);

        let endpoint = self.config.endpoint.clone();
        match self.connector.connect(&endpoint).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.backoff.reset();
                self.missed_heartbeats = 0;
                self.last_error = None;
                self.set_state(ConnectionState::Connected);

                self.next_probe = Some(Instant::now() + self.config.heartbeat_interval);
                self.probe_deadline = None;

                let pending = self.ledger.drain_pending();
                if !pending.is_empty() {
                    log::debug!("Flushing {} pending topic(s)", pending.len());
                    if self.ledger.stage(pending) > 0 {
                        self.debounce_deadline = Some(Instant::now());
                    }
                }

                if self.tokens.session_active() {
                    self.begin_handshake();
                }
            }
            Err(err) => {
                log::warn!("Connect failed: {err}");
                self.last_error = Some(err.to_string());
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_disconnect(&mut self) {
        log::info!("Disconnect requested");

        self.reconnect_at = None;
        self.backoff.reset();

        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }

        self.close_cleanup(ConnectionState::Disconnected);
    }

    fn on_transport_closed(&mut self, clean: bool) {
        self.transport = None;

        if clean {
            log::info!("Connection closed");
            self.close_cleanup(ConnectionState::Disconnected);
        } else {
            log::warn!("Connection lost");
            if self.last_error.is_none() {
                self.last_error = Some("connection closed abnormally".to_string());
            }
            self.close_cleanup(ConnectionState::Error);
        }

        self.schedule_reconnect();
    }

    /// Forget all connection-scoped state. Active topics and the pending
    /// queue do not survive a disconnect; consumers re-subscribe after
    /// observing the reconnect.
    fn close_cleanup(&mut self, state: ConnectionState) {
        self.next_probe = None;
        self.probe_deadline = None;
        self.debounce_deadline = None;
        self.missed_heartbeats = 0;
        self.handshake_in_flight = false;
        self.ledger.clear();
        self.set_state(state);
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        log::info!(
            "Reconnect attempt {} in {}ms",
            self.backoff.attempt(),
            delay.as_millis()
        );
        self.set_state(ConnectionState::Reconnecting);
        // a single pending timer: scheduling again replaces the prior one
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    // ===== liveness =====

    async fn send_probe(&mut self) {
        self.next_probe = None;
        if !self.state.is_open() {
            return;
        }

        let request_id = self.next_request_id();

        // both probe shapes go out together, intermediaries differ in which
        // one they pass through
        let outcome = {
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => return,
            };
            match transport.feed(Envelope::ping()).await {
                Ok(()) => transport.send(Envelope::system_ping(request_id)).await,
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok(()) => {
                log::trace!("Liveness probe sent");
                self.next_probe = Some(Instant::now() + self.config.heartbeat_interval);
                self.probe_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
            }
            Err(err) => {
                log::warn!("Probe send failed: {err}");
                self.last_error = Some(err.to_string());
                self.on_transport_closed(false);
            }
        }
    }

    fn on_probe_deadline(&mut self) {
        self.probe_deadline = None;
        self.missed_heartbeats += 1;
        log::warn!("Liveness probe unanswered, missed count {}", self.missed_heartbeats);

        if self.missed_heartbeats >= self.config.max_missed_heartbeats {
            log::warn!("Missed probe limit reached, connection considered dead");
            // dropping the stream tears the socket down without waiting on a
            // peer that already stopped responding
            self.transport = None;
            self.last_error = Some(format!(
                "{} liveness probes unanswered",
                self.missed_heartbeats
            ));
            self.close_cleanup(ConnectionState::Error);
            self.schedule_reconnect();
        }
    }

    // ===== subscriptions =====

    fn handle_subscribe(&mut self, topics: Vec<Topic>, consumer: ConsumerId) -> bool {
        if topics.is_empty() {
            return true;
        }

        for topic in &topics {
            self.ledger.note_interest(topic, &consumer);
        }

        if !self.state.is_open() {
            log::debug!("Not connected, queueing {} topic(s)", topics.len());
            self.ledger.queue_pending(topics);
            return true;
        }

        let staged = self.ledger.stage(topics);
        if staged == 0 {
            // every topic already subscribed or already in the batch
            return true;
        }

        log::trace!("Staged {staged} topic(s), debounce window armed");
        self.debounce_deadline = Some(Instant::now() + self.config.subscribe_debounce);
        true
    }

    async fn on_debounce(&mut self) {
        self.debounce_deadline = None;

        let batch = self.ledger.take_batch();
        if batch.is_empty() || !self.state.is_open() {
            return;
        }

        if self.tokens.session_active() {
            log::trace!("Fetching credential before subscribing {} topic(s)", batch.len());
            self.spawn_token_fetch(TokenPurpose::Subscribe, Some(batch));
        } else {
            self.send_subscribe(batch, None).await;
        }
    }

    async fn send_subscribe(&mut self, topics: Vec<Topic>, token: Option<String>) {
        log::debug!("Subscribing {} topic(s)", topics.len());
        if self
            .send_envelope(Envelope::subscribe(topics.clone(), token))
            .await
        {
            self.ledger.mark_active(&topics);
        }
    }

    async fn handle_unsubscribe(&mut self, topics: Vec<Topic>, consumer: ConsumerId) -> bool {
        let released = self.ledger.release(&topics, &consumer);
        if released.is_empty() || !self.state.is_open() {
            // bookkeeping-only: nothing lost its last owner, or we are
            // offline and the wire state is gone anyway
            return true;
        }

        log::debug!("Unsubscribing {} topic(s)", released.len());
        self.send_envelope(Envelope::unsubscribe(released)).await
    }

    // ===== authentication =====

    fn begin_handshake(&mut self) {
        if self.handshake_in_flight {
            return;
        }
        self.handshake_in_flight = true;
        log::debug!("Starting authentication handshake");
        self.spawn_token_fetch(TokenPurpose::Handshake, None);
    }

    async fn on_handshake_token(&mut self, token: Option<String>) {
        if !self.state.is_open() {
            self.handshake_in_flight = false;
            return;
        }

        match token {
            Some(token) => {
                if self.send_envelope(Envelope::auth(token)).await {
                    self.set_state(ConnectionState::Authenticating);
                } else {
                    self.handshake_in_flight = false;
                }
            }
            None => {
                // fetch failed: stay connected, unauthenticated; public
                // topics still work
                self.handshake_in_flight = false;
            }
        }
    }

    fn spawn_token_fetch(&self, purpose: TokenPurpose, topics: Option<Vec<Topic>>) {
        let tokens = Arc::clone(&self.tokens);
        let post_tx = self.post_tx.clone();

        tokio::spawn(async move {
            let token = match tokens.token(purpose).await {
                Ok(token) => Some(token),
                Err(err) => {
                    log::debug!("Credential fetch for {purpose} failed, proceeding without: {err}");
                    None
                }
            };

            let postback = match topics {
                Some(topics) => Postback::SubscribeToken { topics, token },
                None => Postback::HandshakeToken { token },
            };
            let _ = post_tx.send(postback);
        });
    }

    fn spawn_revalidation(&self) {
        let session = Arc::clone(&self.session);
        let post_tx = self.post_tx.clone();

        tokio::spawn(async move {
            let valid = session.revalidate().await;
            let _ = post_tx.send(Postback::SessionRevalidated { valid });
        });
    }

    // ===== inbound =====

    fn handle_frame(&mut self, frame: Option<Result<Envelope, WireError>>) {
        match frame {
            None => {
                log::warn!("Transport stream ended unexpectedly");
                self.on_transport_closed(false);
            }
            Some(Ok(envelope)) => self.dispatch(envelope),
            Some(Err(err)) if err.is_fatal() => {
                let clean = matches!(err, WireError::ConnectionClosed { clean: true });
                if !clean {
                    log::warn!("Transport broken: {err}");
                    self.last_error = Some(err.to_string());
                }
                self.on_transport_closed(clean);
            }
            Some(Err(err)) => {
                log::warn!("Transport error ignored: {err}");
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope.classify() {
            Inbound::LivenessReply => {
                log::trace!("Liveness reply received");
                self.missed_heartbeats = 0;
                self.probe_deadline = None;
            }
            Inbound::AuthAck => {
                self.handshake_in_flight = false;
                if self.state.is_open() {
                    log::info!("Authentication acknowledged");
                    self.set_state(ConnectionState::Authenticated);
                }
            }
            Inbound::AuthError { failure, envelope } => {
                self.handshake_in_flight = false;
                log::warn!(
                    "Authentication failed: {failure:?} (code {:?})",
                    envelope.code
                );
                // auth failures never close the transport
                if self.state.is_open() {
                    self.set_state(ConnectionState::Connected);
                }
                if failure.should_revalidate() {
                    self.spawn_revalidation();
                }
            }
            Inbound::SubscriptionAck(envelope) => {
                log::debug!("Subscription ack: {} {:?}", envelope.kind, envelope.topics);
            }
            Inbound::Data(envelope) => {
                let message = Arc::new(envelope);
                let delivered = self.registry.dispatch(&message);
                log::trace!(
                    "Dispatched {} message to {delivered} of {} listener(s)",
                    message.kind,
                    self.registry.len()
                );
            }
        }
    }

    // ===== plumbing =====

    async fn send_envelope(&mut self, envelope: Envelope) -> bool {
        if !self.state.is_open() {
            log::trace!("Send of {} dropped, transport not open", envelope.kind);
            return false;
        }

        let result = match self.transport.as_mut() {
            Some(transport) => transport.send(envelope).await,
            None => return false,
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Send failed, transport broken: {err}");
                self.last_error = Some(err.to_string());
                self.on_transport_closed(false);
                false
            }
        }
    }

    fn next_request_id(&mut self) -> String {
        self.request_seq += 1;
        format!("req-{}", self.request_seq)
    }
}

#[cfg(test)]
mod test {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures_util::Sink;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::task::yield_now;
    use url::Url;

    use super::*;
    use crate::auth::TokenError;
    use crate::client::transport::ConnectError;
    use crate::client::Client;
    use crate::config::Config;
    use crate::wire::kind;

    // ===== in-memory transport =====

    struct FakeTransport {
        incoming: mpsc::UnboundedReceiver<Result<Envelope, WireError>>,
        outgoing: mpsc::UnboundedSender<Envelope>,
    }

    impl Stream for FakeTransport {
        type Item = Result<Envelope, WireError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.incoming.poll_recv(cx)
        }
    }

    impl Sink<Envelope> for FakeTransport {
        type Error = WireError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WireError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Envelope) -> Result<(), WireError> {
            self.outgoing
                .send(item)
                .map_err(|_| WireError::ConnectionClosed { clean: false })
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WireError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WireError>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Test-side end of one fake connection.
    struct Link {
        to_client: mpsc::UnboundedSender<Result<Envelope, WireError>>,
        from_client: mpsc::UnboundedReceiver<Envelope>,
    }

    impl Link {
        fn inject(&self, raw: serde_json::Value) {
            let envelope: Envelope = serde_json::from_value(raw).unwrap();
            self.to_client.send(Ok(envelope)).unwrap();
        }

        fn try_next(&mut self) -> Option<Envelope> {
            self.from_client.try_recv().ok()
        }
    }

    struct FakeConnector {
        links: mpsc::UnboundedSender<Link>,
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        type Transport = FakeTransport;

        async fn connect(&mut self, endpoint: &Url) -> Result<FakeTransport, ConnectError> {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();

            self.links
                .send(Link {
                    to_client: in_tx,
                    from_client: out_rx,
                })
                .map_err(|_| ConnectError {
                    url: endpoint.to_string(),
                    source: tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                })?;

            Ok(FakeTransport {
                incoming: in_rx,
                outgoing: out_tx,
            })
        }
    }

    // ===== fake collaborators =====

    struct FakeSession {
        active: AtomicBool,
        token: Option<&'static str>,
        revalidations: AtomicUsize,
        revalidate_result: bool,
    }

    impl FakeSession {
        fn anonymous() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(false),
                token: None,
                revalidations: AtomicUsize::new(0),
                revalidate_result: false,
            })
        }

        fn logged_in(token: &'static str) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(true),
                token: Some(token),
                revalidations: AtomicUsize::new(0),
                revalidate_result: false,
            })
        }

        fn set_active(&self, active: bool) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl TokenProvider for FakeSession {
        async fn token(&self, _purpose: TokenPurpose) -> Result<String, TokenError> {
            self.token
                .map(str::to_string)
                .ok_or_else(|| TokenError::new("no token"))
        }

        fn session_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SessionRefresh for FakeSession {
        async fn revalidate(&self) -> bool {
            self.revalidations.fetch_add(1, Ordering::SeqCst);
            self.revalidate_result
        }
    }

    // ===== harness =====

    /// A config whose heartbeat never fires, so probe frames do not mix
    /// into subscription assertions.
    fn quiet_config() -> Config {
        let mut config = Config::new("ws://localhost:9/ws").unwrap();
        config.heartbeat_interval = Duration::from_secs(3600);
        config
    }

    fn spawn_client(
        config: Config,
        session: Arc<FakeSession>,
    ) -> (Client, mpsc::UnboundedReceiver<Link>) {
        let _ = pretty_env_logger::try_init();

        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let connector = FakeConnector { links: links_tx };
        let client =
            Client::spawn_with_connector(connector, config, session.clone(), session);

        (client, links_rx)
    }

    /// Let the worker and its side-tasks drain their queues.
    async fn settle() {
        for _ in 0..20 {
            yield_now().await;
        }
    }

    async fn debounce_elapse() {
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
    }

    fn topic(s: &str) -> Topic {
        Topic::from(s)
    }

    // ===== tests =====

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());

        client.connect();
        client.connect();
        settle().await;

        // hold the link, dropping it would tear the fake transport down
        let _link = links.try_recv().expect("first connect opens a transport");
        assert!(links.try_recv().is_err(), "second connect is a no-op");

        client.connect();
        settle().await;
        assert!(links.try_recv().is_err(), "connect while connected is a no-op");
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_coalesces_and_dedups() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        assert!(client.subscribe(vec![topic("a")], None).await);
        debounce_elapse().await;

        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("a")]);

        // two bursts for {a, b} while a is already active: one wire
        // message, containing only b
        assert!(client.subscribe(vec![topic("a"), topic("b")], Some("c1".into())).await);
        assert!(client.subscribe(vec![topic("a"), topic("b")], Some("c2".into())).await);
        debounce_elapse().await;

        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("b")]);
        assert!(link.try_next().is_none(), "burst coalesced into one message");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_ref_counted() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        assert!(client.subscribe(vec![topic("t")], Some("c1".into())).await);
        debounce_elapse().await;
        assert_eq!(link.try_next().unwrap().kind, kind::SUBSCRIBE);

        // second consumer joins without wire traffic
        assert!(client.subscribe(vec![topic("t")], Some("c2".into())).await);
        debounce_elapse().await;
        assert!(link.try_next().is_none());

        // first consumer leaves, topic still owned
        assert!(client.unsubscribe(vec![topic("t")], Some("c1".into())).await);
        settle().await;
        assert!(link.try_next().is_none());

        // last consumer leaves, exactly one wire unsubscribe
        assert!(client.unsubscribe(vec![topic("t")], Some("c2".into())).await);
        settle().await;
        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::UNSUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("t")]);
        assert!(link.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_unsubscribe_keeps_other_owners() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        // anonymous caller and a named consumer share one topic
        assert!(client.subscribe(vec![topic("t")], None).await);
        assert!(client.subscribe(vec![topic("t")], Some("c2".into())).await);
        debounce_elapse().await;
        assert_eq!(link.try_next().unwrap().kind, kind::SUBSCRIBE);

        // the anonymous release only drops its own ref
        assert!(client.unsubscribe(vec![topic("t")], None).await);
        settle().await;
        assert!(link.try_next().is_none(), "topic still owned by c2");

        assert!(client.unsubscribe(vec![topic("t")], Some("c2".into())).await);
        settle().await;
        assert_eq!(link.try_next().unwrap().kind, kind::UNSUBSCRIBE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_consumer_releases_owned_topics() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        client.subscribe(vec![topic("t")], Some("c1".into())).await;
        client.subscribe(vec![topic("t")], Some("c2".into())).await;
        debounce_elapse().await;
        assert_eq!(link.try_next().unwrap().kind, kind::SUBSCRIBE);

        client.cleanup_consumer("c1".into());
        settle().await;
        assert!(link.try_next().is_none(), "topic still owned by c2");

        client.cleanup_consumer("c2".into());
        settle().await;
        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::UNSUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("t")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_force_reconnect() {
        // real probe timings, default thresholds
        let (client, mut links) = spawn_client(
            Config::new("ws://localhost:9/ws").unwrap(),
            FakeSession::anonymous(),
        );
        client.connect();
        settle().await;
        let mut link1 = links.try_recv().unwrap();

        // never answer any probe; paused time auto-advances through three
        // probe cycles, the dead-connection close and the reconnect delay
        let link2 = links.recv().await;
        assert!(link2.is_some(), "a fresh transport was opened");

        let mut pings = 0;
        let mut system_pings = 0;
        while let Some(frame) = link1.try_next() {
            if frame.kind == kind::PING {
                pings += 1;
            } else if frame.kind == kind::REQUEST {
                assert_eq!(frame.action.as_deref(), Some(kind::PING));
                system_pings += 1;
            }
        }
        assert_eq!(pings, 3, "one minimal probe per cycle");
        assert_eq!(system_pings, 3, "one structured probe per cycle");

        // old transport was dropped when the connection was declared dead
        assert!(link1.from_client.recv().await.is_none());

        settle().await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.connection_error().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_reply_resets_missed_count() {
        let (client, mut links) = spawn_client(
            Config::new("ws://localhost:9/ws").unwrap(),
            FakeSession::anonymous(),
        );
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        // run two probe cycles, answering each probe just before the
        // deadline so the missed count never accumulates
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(25)).await;
            settle().await;
            assert_eq!(link.try_next().unwrap().kind, kind::PING);
            assert_eq!(link.try_next().unwrap().kind, kind::REQUEST);
            link.inject(json!({"type": "pong"}));
            settle().await;
            tokio::time::advance(Duration::from_secs(5)).await;
            settle().await;
        }

        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(links.try_recv().is_err(), "no reconnect happened");
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_clears_on_abnormal_close() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link1 = links.try_recv().unwrap();

        client.subscribe(vec![topic("a")], None).await;
        debounce_elapse().await;
        assert_eq!(link1.try_next().unwrap().kind, kind::SUBSCRIBE);

        // server goes away without a close frame
        drop(link1);
        settle().await;

        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(client.connection_error().await.is_some());

        // a topic requested while offline is queued, not sent
        assert!(client.subscribe(vec![topic("c")], None).await);

        // reconnect fires after the backoff delay
        let mut link2 = links.recv().await.unwrap();
        settle().await;

        let frame = link2.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("c")]);
        assert!(client.connection_error().await.is_none());

        // the active set was cleared: re-subscribing "a" hits the wire again
        client.subscribe(vec![topic("a")], None).await;
        debounce_elapse().await;
        let frame = link2.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert_eq!(frame.topics.unwrap(), vec![topic("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_leaves_no_error() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let link = links.try_recv().unwrap();

        link.to_client
            .send(Err(WireError::ConnectionClosed { clean: true }))
            .unwrap();
        settle().await;

        // clean close still schedules a reconnect, but records no error
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(client.connection_error().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_handshake_and_degradation() {
        let session = FakeSession::logged_in("tok1");
        let (client, mut links) = spawn_client(quiet_config(), session.clone());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        // handshake: credential fetched, AUTH sent, ack upgrades the state
        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::AUTH);
        assert_eq!(frame.auth_token.as_deref(), Some("tok1"));
        assert_eq!(client.state(), ConnectionState::Authenticating);

        link.inject(json!({"type": "AUTH_ACK"}));
        settle().await;
        assert_eq!(client.state(), ConnectionState::Authenticated);

        // subscribes attach the credential opportunistically
        client.subscribe(vec![topic("wallet:me")], None).await;
        debounce_elapse().await;
        settle().await;
        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert_eq!(frame.auth_token.as_deref(), Some("tok1"));

        // an expired credential degrades to Connected, escalates to the
        // session collaborator once, and never closes the transport
        link.inject(json!({"type": "AUTH_ERROR", "code": 4001, "reason": "token_expired"}));
        settle().await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(session.revalidations.load(Ordering::SeqCst), 1);
        assert!(client.send(Envelope::new("NOOP")).await, "transport still open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_credential_fetch_degrades_silently() {
        // logged in but the provider has nothing to hand out
        let broken = Arc::new(FakeSession {
            active: AtomicBool::new(true),
            token: None,
            revalidations: AtomicUsize::new(0),
            revalidate_result: false,
        });
        let (client, mut links) = spawn_client(quiet_config(), broken);
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        assert!(link.try_next().is_none(), "no AUTH without a credential");
        assert_eq!(client.state(), ConnectionState::Connected);

        // public subscriptions still work, without a token attached
        client.subscribe(vec![topic("prices")], None).await;
        debounce_elapse().await;
        settle().await;
        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::SUBSCRIBE);
        assert!(frame.auth_token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_login_triggers_handshake() {
        let session = FakeSession::logged_in("tok2");
        session.set_active(false);
        let (client, mut links) = spawn_client(quiet_config(), session.clone());

        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();
        assert!(link.try_next().is_none(), "no handshake while logged out");

        session.set_active(true);
        client.notify_login();
        settle().await;

        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::AUTH);
        assert_eq!(frame.auth_token.as_deref(), Some("tok2"));
        assert_eq!(client.state(), ConnectionState::Authenticating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_transport() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());

        assert!(!client.send(Envelope::new("DATA")).await);

        client.connect();
        settle().await;
        let _link = links.try_recv().unwrap();

        assert!(client.send(Envelope::new("DATA")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_correlation_id() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        let mut params = serde_json::Map::new();
        params.insert("limit".to_string(), 50.into());
        assert!(client.request(topic("wallet"), "get_balances", params).await);

        let frame = link.try_next().unwrap();
        assert_eq!(frame.kind, kind::REQUEST);
        assert_eq!(frame.action.as_deref(), Some("get_balances"));
        assert!(frame.request_id.unwrap().starts_with("req-"));
        assert_eq!(frame.extra["limit"], 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_fan_out_end_to_end() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let link = links.try_recv().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let guard = client
            .register_listener(
                "ui",
                ["DATA"],
                Some(vec![topic("x")]),
                move |_message: Arc<Envelope>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        link.inject(json!({"type": "DATA", "topic": "y", "data": {}}));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0, "topic filter applies");

        link.inject(json!({"type": "DATA", "topic": "x", "data": {}}));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        link.inject(json!({"type": "SYSTEM", "topic": "y", "data": {}}));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2, "system bypasses filters");

        drop(guard);
        settle().await;
        link.inject(json!({"type": "DATA", "topic": "x", "data": {}}));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2, "unregistered on drop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_when_last_handle_drops() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        drop(client);
        settle().await;

        // the command channel closed, the worker closed the transport and
        // exited
        assert!(link.from_client.recv().await.is_none());
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(links.try_recv().is_err(), "no further connection attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_deliberate_teardown() {
        let (client, mut links) = spawn_client(quiet_config(), FakeSession::anonymous());
        client.connect();
        settle().await;
        let mut link = links.try_recv().unwrap();

        client.disconnect();
        settle().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(link.from_client.recv().await.is_none(), "transport closed");

        // no reconnect timer: even after a long wait no transport appears
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert!(links.try_recv().is_err());

        // but connect starts over
        client.connect();
        settle().await;
        assert!(links.try_recv().is_ok());
    }
}
