use crate::api::ApiClient;
use crate::auth::{AuthError, TokenManager};
use crate::cache::ConversationCache;
use crate::config::ClientConfig;
use crate::replay;
use crate::roster::PeerRoster;
use crate::store::KeyValueStore;
use crate::store::traits::keys;
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};
use crate::types::Operation;
use crate::types::events::{DeliveryFailure, Event, EventBus};
use crate::wire::{self, WireFrame, events as wire_events};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, watch};

/// Lifecycle of the realtime session.
///
/// `Subscribed` is the only state in which outbound frames flow; everything
/// else queues. `Faulted` means reconnecting was abandoned after repeated
/// credential rejections and stays until a fresh `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Faulted,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connecting")]
    AlreadyConnecting,

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("connection closed before the subscription completed")]
    ConnectionClosed,

    #[error("connection lost")]
    ConnectionLost,

    #[error("credentials rejected by the server")]
    CredentialsRejected,

    #[error("malformed payload for event '{0}'")]
    BadPayload(String),

    #[error("replay halted at '{event}': {source}")]
    ReplayFailed {
        event: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// The realtime session connector.
///
/// Owns the transport for the lifetime of a connection, routes every inbound
/// event to the cache, roster, and event bus, and keeps reconnecting until
/// told to stop or until credentials are rejected too many times in a row.
/// All collaborators are injected once at construction; nothing is attached
/// or detached per connection, so a reconnect can never double-register a
/// handler.
pub struct Client {
    config: ClientConfig,
    token_manager: Arc<TokenManager>,
    api: Arc<ApiClient>,
    cache: Arc<ConversationCache>,
    roster: Arc<PeerRoster>,
    storage: Arc<dyn KeyValueStore>,
    bus: EventBus,
    transport_factory: Arc<dyn TransportFactory>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    transport_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Frames queued by the cache, drained only while subscribed. The
    /// receiver outlives individual connections so nothing queued is lost
    /// across a reconnect.
    outbound: Mutex<mpsc::Receiver<WireFrame>>,

    state_tx: watch::Sender<ConnectionState>,
    is_connecting: AtomicBool,
    is_running: AtomicBool,
    expected_disconnect: AtomicBool,
    auth_failures: AtomicU32,
    shutdown_notifier: Notify,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        token_manager: Arc<TokenManager>,
        api: Arc<ApiClient>,
        cache: Arc<ConversationCache>,
        roster: Arc<PeerRoster>,
        storage: Arc<dyn KeyValueStore>,
        bus: EventBus,
        transport_factory: Arc<dyn TransportFactory>,
        outbound: mpsc::Receiver<WireFrame>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            token_manager,
            api,
            cache,
            roster,
            storage,
            bus,
            transport_factory,
            transport: Mutex::new(None),
            transport_events: Mutex::new(None),
            outbound: Mutex::new(outbound),
            state_tx,
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            auth_failures: AtomicU32::new(0),
            shutdown_notifier: Notify::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// A watch handle for observing state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state() == ConnectionState::Subscribed
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state();
        if previous != state {
            debug!(target: "Client", "State {previous:?} -> {state:?}");
            self.state_tx.send_replace(state);
        }
    }

    /// Opens a transport with valid credentials. On success the connection
    /// sits in `Authenticating` until the server's subscription confirmation
    /// arrives through the read loop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            debug!(target: "Client", "Connect already in progress");
            return Err(ClientError::AlreadyConnecting);
        }
        let self_clone = self.clone();
        let _guard = scopeguard::guard((), move |_| {
            self_clone.is_connecting.store(false, Ordering::SeqCst);
        });

        if self.state() == ConnectionState::Subscribed {
            debug!(target: "Client", "Already subscribed");
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let cred = match self.token_manager.ensure_valid().await {
            Ok(cred) => cred,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        // A rotated connection token from a previous session outranks the
        // access token until the server rejects it.
        let auth_token = match self.storage.get(keys::SOCKET_TOKEN).await {
            Ok(Some(rotated)) => rotated,
            Ok(None) => cred.access_token,
            Err(e) => {
                warn!(target: "Client", "Failed to read rotated token: {e}");
                cred.access_token
            }
        };
        let params = ConnectParams {
            device_id: self.config.device.uuid.clone(),
            auth_token,
        };

        let (transport, mut events) = match self.transport_factory.create_transport(params).await {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ClientError::Transport(e));
            }
        };

        // The factory signals readiness before relaying any server frame.
        loop {
            match events.recv().await {
                Some(TransportEvent::Connected) => break,
                Some(TransportEvent::FrameReceived(_)) => {
                    warn!(target: "Client", "Frame before connection confirmation, dropping");
                }
                Some(TransportEvent::Disconnected) | None => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ClientError::ConnectionClosed);
                }
            }
        }

        self.set_state(ConnectionState::Authenticating);
        *self.transport.lock().await = Some(transport);
        *self.transport_events.lock().await = Some(events);
        Ok(())
    }

    /// Connects and keeps the session alive until sign-out, a credential
    /// fault, or session expiry. Transient failures retry on a fixed
    /// backoff; consecutive credential rejections beyond the configured
    /// bound park the client in `Faulted`.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "Run loop already active");
            return;
        }
        self.auth_failures.store(0, Ordering::SeqCst);

        while self.is_running.load(Ordering::SeqCst) {
            self.expected_disconnect.store(false, Ordering::SeqCst);

            match self.connect().await {
                Ok(()) => match self.read_loop().await {
                    Ok(()) => {
                        debug!(target: "Client", "Connection closed cleanly");
                    }
                    Err(ClientError::CredentialsRejected) => {
                        if self.handle_credentials_rejected().await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(target: "Client", "Connection error: {e}");
                    }
                },
                Err(ClientError::Auth(_)) => {
                    info!(target: "Client", "Session expired, stopping");
                    self.set_state(ConnectionState::Disconnected);
                    self.bus.dispatch(&Event::SessionExpired);
                    self.is_running.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(target: "Client", "Failed to connect: {e}");
                    if !self.api.heartbeat().await {
                        self.bus.dispatch(&Event::NetworkUnavailable);
                    }
                }
            }

            self.cleanup_connection().await;

            if self.expected_disconnect.load(Ordering::SeqCst)
                || !self.is_running.load(Ordering::SeqCst)
            {
                break;
            }

            let backoff = self.config.reconnect.backoff;
            debug!(target: "Client", "Reconnecting in {backoff:?}");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown_notifier.notified() => break,
            }
        }

        if self.state() != ConnectionState::Faulted {
            self.set_state(ConnectionState::Disconnected);
        }
        debug!(target: "Client", "Run loop exited");
    }

    /// Returns true when the run loop must stop for good.
    async fn handle_credentials_rejected(self: &Arc<Self>) -> bool {
        let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let bound = self.config.reconnect.max_auth_failures;
        if failures >= bound {
            error!(
                target: "Client",
                "Giving up after {failures} consecutive credential rejections"
            );
            self.cleanup_connection().await;
            self.set_state(ConnectionState::Faulted);
            self.bus.dispatch(&Event::SessionFault {
                reason: format!("credentials rejected {failures} times"),
            });
            self.is_running.store(false, Ordering::SeqCst);
            return true;
        }

        warn!(
            target: "Client",
            "Credentials rejected ({failures}/{bound}), refreshing before retry"
        );
        // A stale rotated token is the usual culprit; drop it so the next
        // attempt authenticates with the access token.
        if let Err(e) = self.storage.remove(keys::SOCKET_TOKEN).await {
            warn!(target: "Client", "Failed to drop rotated token: {e}");
        }
        if self.token_manager.ensure_valid().await.is_err() {
            self.cleanup_connection().await;
            self.set_state(ConnectionState::Disconnected);
            self.bus.dispatch(&Event::SessionExpired);
            self.is_running.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Processes transport events and drains the outbound queue until the
    /// connection ends. The queue arm only runs while subscribed, so frames
    /// produced early simply wait.
    async fn read_loop(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut events = match self.transport_events.lock().await.take() {
            Some(events) => events,
            None => return Err(ClientError::ConnectionClosed),
        };
        let mut outbound = self.outbound.lock().await;
        let mut outbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Client/Socket", "Shutdown requested, leaving read loop");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(TransportEvent::FrameReceived(frame)) => {
                        if let Err(e) = self.handle_frame(&frame).await {
                            if matches!(e, ClientError::CredentialsRejected) {
                                return Err(e);
                            }
                            warn!(target: "Client/Socket", "Failed to handle frame: {e}");
                        }
                    }
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => {
                        if self.expected_disconnect.load(Ordering::SeqCst) {
                            debug!(target: "Client/Socket", "Expected disconnect");
                            return Ok(());
                        }
                        warn!(target: "Client/Socket", "Connection lost");
                        self.bus.dispatch(&Event::Disconnected);
                        return Err(ClientError::ConnectionLost);
                    }
                },
                frame = outbound.recv(), if outbound_open && self.is_subscribed() => match frame {
                    Some(frame) => self.send_frame(&frame).await?,
                    None => outbound_open = false,
                },
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, raw: &[u8]) -> Result<(), ClientError> {
        let frame = match WireFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Client/Recv", "Undecodable frame ({} bytes): {e}", raw.len());
                return Ok(());
            }
        };
        debug!(target: "Client/Recv", "<-- {}", frame.event);

        let ack = frame.ack;
        let result = if frame.event == wire_events::SUCCESS {
            self.handle_subscribed().await;
            Ok(())
        } else {
            self.handle_event(&frame.event, frame.payload, 0).await
        };
        if let Some(id) = ack {
            self.send_ack(id).await;
        }
        result
    }

    /// Shared dispatch for live frames and replayed operations. The
    /// subscription handshake never passes through here; `handle_frame`
    /// routes it first, so a `success` buffered into a replay batch is
    /// inert and cannot restart the backlog drain.
    pub(crate) async fn handle_event(
        self: &Arc<Self>,
        name: &str,
        payload: serde_json::Value,
        remaining_in_batch: usize,
    ) -> Result<(), ClientError> {
        match name {
            wire_events::SUCCESS => {
                debug!(target: "Client/Replay", "Skipping buffered subscription handshake");
            }
            wire_events::NEW_MESSAGE => {
                let parsed: wire::InboundMessagePayload = parse(name, payload)?;
                self.cache.receive(parsed, remaining_in_batch).await;
            }
            wire_events::FRIEND_LOGIN | wire_events::FRIEND_LOGOUT => {
                let parsed: wire::PresencePayload = parse(name, payload)?;
                let online = name == wire_events::FRIEND_LOGIN;
                self.roster.set_presence(&parsed.friend_id, online).await;
                self.bus.dispatch(&Event::PresenceChanged {
                    peer_id: parsed.friend_id,
                    online,
                });
            }
            wire_events::USER_CONFIRMED => {
                let parsed: wire::PeerConfirmedPayload = parse(name, payload)?;
                self.roster.confirm(parsed.friend.clone()).await;
                self.bus.dispatch(&Event::PeerConfirmed(parsed.friend));
            }
            wire_events::FRIEND_REMOVED => {
                let parsed: wire::PeerRemovedPayload = parse(name, payload)?;
                self.roster.remove(&parsed.peer_id).await;
                self.bus.dispatch(&Event::PeerRemoved {
                    peer_id: parsed.peer_id,
                });
            }
            wire_events::NEW_NOTIFICATION => {
                self.bus.dispatch(&Event::Notification(payload));
            }
            wire_events::USER_NOT_ONLINE => {
                self.bus
                    .dispatch(&Event::DeliveryFailed(DeliveryFailure::RecipientOffline));
            }
            wire_events::NOT_IN_FRIENDS_LIST => {
                self.bus
                    .dispatch(&Event::DeliveryFailed(DeliveryFailure::NotInRoster));
            }
            wire_events::NEW_TOKEN => {
                let parsed: wire::TokenRotatedPayload = parse(name, payload)?;
                info!(target: "Client", "Connection token rotated by the server");
                if let Err(e) = self.storage.set(keys::SOCKET_TOKEN, &parsed.token).await {
                    warn!(target: "Client", "Failed to persist rotated token: {e}");
                }
            }
            wire_events::ERROR => {
                let parsed: wire::ServerErrorPayload = parse(name, payload).unwrap_or_default();
                if parsed.is_token_expired() {
                    warn!(target: "Client", "Server rejected our credentials: {}", parsed.reason);
                    return Err(ClientError::CredentialsRejected);
                }
                error!(target: "Client", "Server error: {}", parsed.reason);
            }
            other => {
                debug!(target: "Client/Recv", "Unhandled event '{other}'");
            }
        }
        Ok(())
    }

    async fn handle_subscribed(self: &Arc<Self>) {
        info!(target: "Client", "Subscription confirmed");
        self.auth_failures.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Subscribed);
        self.bus.dispatch(&Event::Connected);

        // The backlog drain runs beside the live loop; correlation ids keep
        // the two streams from double-applying a message.
        let client = self.clone();
        tokio::spawn(async move {
            client.sync_missed_operations().await;
        });
    }

    /// Fetches and applies the operations buffered while offline. The batch
    /// is acknowledged only after every operation applied.
    pub async fn sync_missed_operations(self: &Arc<Self>) {
        match self.api.get_socket_operations().await {
            Ok(ops) => {
                if ops.is_empty() {
                    debug!(target: "Client/Replay", "No buffered operations");
                    return;
                }
                info!(target: "Client/Replay", "Applying {} buffered operations", ops.len());
                if let Err(e) = self.apply_operations(ops).await {
                    warn!(
                        target: "Client/Replay",
                        "{e}; batch left unacknowledged for redelivery"
                    );
                }
            }
            Err(e) => {
                warn!(target: "Client/Replay", "Failed to fetch buffered operations: {e}");
            }
        }
    }

    /// Applies a replay batch in array order after collapsing presence
    /// flips. Stops at the first failure, leaving the batch unacknowledged.
    pub async fn apply_operations(self: &Arc<Self>, ops: Vec<Operation>) -> Result<(), ClientError> {
        if ops.is_empty() {
            return Ok(());
        }
        let ops = replay::collapse_presence(ops);
        let total = ops.len();
        for (index, op) in ops.into_iter().enumerate() {
            if let Some(seq) = op.seq {
                debug!(target: "Client/Replay", "Applying '{}' (seq hint {seq})", op.name);
            }
            let remaining = total - index - 1;
            if let Err(e) = self.handle_event(&op.name, op.payload, remaining).await {
                return Err(ClientError::ReplayFailed {
                    event: op.name,
                    source: Box::new(e),
                });
            }
        }
        if let Err(e) = self.api.delete_operations().await {
            // Redelivered batches are deduplicated by correlation id.
            warn!(target: "Client/Replay", "Failed to acknowledge replay batch: {e}");
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &WireFrame) -> Result<(), ClientError> {
        let encoded = frame
            .encode()
            .map_err(|e| ClientError::Transport(e.into()))?;
        let transport = self.transport.lock().await.clone();
        match transport {
            Some(transport) => {
                debug!(target: "Client/Send", "--> {}", frame.event);
                transport
                    .send(&encoded)
                    .await
                    .map_err(ClientError::Transport)
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Ack failures are logged and swallowed; losing an ack never takes the
    /// connection down.
    async fn send_ack(&self, id: u64) {
        if let Err(e) = self.send_frame(&WireFrame::ack_reply(id)).await {
            warn!(target: "Client/Send", "Failed to acknowledge event {id}: {e}");
        }
    }

    async fn cleanup_connection(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        *self.transport_events.lock().await = None;
        if self.state() != ConnectionState::Faulted {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Deliberate teardown for sign-out or shutdown. Stops the run loop,
    /// closes the transport, and leaves the client reusable.
    pub async fn disconnect(&self) {
        self.expected_disconnect.store(true, Ordering::SeqCst);
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown_notifier.notify_waiters();
        self.cleanup_connection().await;
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: serde_json::Value) -> Result<T, ClientError> {
    serde_json::from_value(payload).map_err(|_| ClientError::BadPayload(event.to_string()))
}
