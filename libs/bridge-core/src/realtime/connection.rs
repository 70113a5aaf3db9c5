//! Shared realtime connection driver.
//!
//! One duplex socket per manager, shared by every feature subscriber.
//! The driver task owns the socket and walks the state machine
//! `Disconnected → Connecting → Connected → Disconnected (close) →
//! Connecting (retry)`, with `→ Terminated` on explicit teardown. Every
//! entry into Connecting re-acquires a credential through the refresh
//! orchestrator and attaches it to the handshake.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::broadcast::{AuthEvent, AuthEvents};
use crate::refresh::RefreshOrchestrator;
use crate::signals::UiSignals;

use super::frames::{BrokerFrame, ClientFrame, MessagePayload, OP_MESSAGE};
use super::registry::{Callback, Payload, SubscriptionRegistry};

/// Reconnect backoff cap in seconds.
const MAX_BACKOFF_SECS: u64 = 60;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle states, observable through [`RealtimeConnectionManager::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminated,
}

enum Command {
    /// A newly registered subscription wants binding.
    Bind(u64),
    /// A subscription was cancelled; release it on the broker if bound.
    Unsubscribe { key: u64, was_bound: bool },
    /// Fire-and-forget application send.
    Publish { destination: String, body: Value },
    /// Close and reconnect with a freshly acquired credential.
    Recycle,
    /// Full teardown: discard all subscriptions and stop.
    Terminate,
}

/// Options for the realtime connection.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// Broker URL (e.g. `ws://localhost:9094/ws`).
    pub url: String,
    /// Minimum credential TTL demanded at handshake time.
    pub min_ttl: Duration,
}

/// Handle to an active subscription. `unsubscribe` is safe to call at
/// any connection state, including while the subscription is still
/// pending.
pub struct SubscriptionHandle {
    key: u64,
    registry: Arc<SubscriptionRegistry>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        if let Some(was_bound) = self.registry.cancel(self.key) {
            let _ = self.cmd_tx.send(Command::Unsubscribe {
                key: self.key,
                was_bound,
            });
        }
    }
}

/// Manager for the shared realtime connection.
pub struct RealtimeConnectionManager {
    registry: Arc<SubscriptionRegistry>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl RealtimeConnectionManager {
    /// Spawn the driver task and the auth-event listener.
    pub fn spawn(
        options: RealtimeOptions,
        refresher: RefreshOrchestrator,
        signals: UiSignals,
        mut auth_events: AuthEvents,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            options,
            refresher,
            signals,
            registry: registry.clone(),
            state_tx,
        };
        tokio::spawn(driver.run(cmd_rx));

        // Cross-tab auth events steer the connection: a refresh elsewhere
        // recycles it so the next handshake carries the new credential; a
        // logout tears it down.
        let events_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = auth_events.recv().await {
                match event {
                    AuthEvent::TokenRefreshed { .. } => {
                        if events_tx.send(Command::Recycle).is_err() {
                            break;
                        }
                    }
                    AuthEvent::LoggedOut => {
                        let _ = events_tx.send(Command::Terminate);
                        break;
                    }
                    AuthEvent::BypassError { .. } => {}
                }
            }
        });

        Self {
            registry,
            cmd_tx,
            state_rx,
        }
    }

    /// Register a callback for a destination.
    ///
    /// If the connection is not yet open the subscription is queued and
    /// bound on connect, in registration order. The callback survives
    /// reconnects without re-subscribing.
    pub fn subscribe(
        &self,
        destination: &str,
        callback: impl Fn(Payload) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let key = self
            .registry
            .register(destination, Arc::new(callback) as Callback);
        let _ = self.cmd_tx.send(Command::Bind(key));
        SubscriptionHandle {
            key,
            registry: self.registry.clone(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Best-effort send. A no-op (not an error) while the connection is
    /// not open.
    pub fn publish(&self, destination: &str, body: Value) {
        let _ = self.cmd_tx.send(Command::Publish {
            destination: destination.to_string(),
            body,
        });
    }

    /// Force a deactivate/reactivate cycle (next handshake re-acquires
    /// the credential).
    pub fn recycle(&self) {
        let _ = self.cmd_tx.send(Command::Recycle);
    }

    /// Tear the connection down and discard every subscription.
    pub fn terminate(&self) {
        let _ = self.cmd_tx.send(Command::Terminate);
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Number of registered (uncancelled) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }
}

struct Driver {
    options: RealtimeOptions,
    refresher: RefreshOrchestrator,
    signals: UiSignals,
    registry: Arc<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
}

/// What to do after leaving a waiting state.
enum Resume {
    Connect,
    Terminate,
}

impl Driver {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut reconnect_attempts: u32 = 0;

        loop {
            let _ = self.state_tx.send(ConnectionState::Connecting);

            // Always a fresh credential at handshake time, never one
            // captured earlier.
            let Some(credential) = self.refresher.ensure_fresh(self.options.min_ttl).await else {
                // Abandon the attempt rather than retrying in a loop; the
                // UI decides whether to re-authenticate.
                self.signals
                    .auth_expired(Some("authentication expired".to_string()));
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                match self.park(&mut cmd_rx).await {
                    Resume::Connect => continue,
                    Resume::Terminate => return self.terminate(),
                }
            };

            let socket = match self.connect(&credential.token).await {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(error = %err, url = %self.options.url, "realtime connect failed");
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    let backoff =
                        Duration::from_secs(2u64.pow(reconnect_attempts).min(MAX_BACKOFF_SECS));
                    reconnect_attempts += 1;
                    match self.backoff(&mut cmd_rx, backoff).await {
                        Resume::Connect => continue,
                        Resume::Terminate => return self.terminate(),
                    }
                }
            };
            reconnect_attempts = 0;

            match self.serve(socket, &mut cmd_rx).await {
                Resume::Terminate => return self.terminate(),
                Resume::Connect => {
                    // Connection lost or recycled: registrations stay,
                    // bindings do not.
                    self.registry.unbind_all();
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Open the socket with the credential attached to the handshake.
    async fn connect(&self, token: &str) -> crate::error::Result<Socket> {
        let mut request = self.options.url.as_str().into_client_request()?;
        let bearer = http::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| crate::error::BridgeError::config("credential is not header-safe"))?;
        request.headers_mut().insert(http::header::AUTHORIZATION, bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(socket)
    }

    /// Run one connected session until close, recycle, or terminate.
    async fn serve(&self, socket: Socket, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Resume {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let _ = self.state_tx.send(ConnectionState::Connected);

        // Bind queued and surviving subscriptions in registration order.
        for (key, destination) in self.registry.to_bind() {
            let frame = ClientFrame::subscribe(key, &destination);
            if ws_tx.send(Message::Text(frame.to_text().into())).await.is_err() {
                return Resume::Connect;
            }
            self.registry.mark_bound(key);
        }

        loop {
            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(Message::Ping(data))) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                return Resume::Connect;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Resume::Connect,
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "realtime socket error");
                            return Resume::Connect;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Terminate) => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            return Resume::Terminate;
                        }
                        Some(Command::Recycle) => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            return Resume::Connect;
                        }
                        Some(Command::Bind(key)) => {
                            if let Some(destination) = self.registry.pending_destination(key) {
                                let frame = ClientFrame::subscribe(key, &destination);
                                if ws_tx.send(Message::Text(frame.to_text().into())).await.is_err() {
                                    return Resume::Connect;
                                }
                                self.registry.mark_bound(key);
                            }
                        }
                        Some(Command::Unsubscribe { key, was_bound }) => {
                            if was_bound {
                                let frame = ClientFrame::unsubscribe(key);
                                if ws_tx.send(Message::Text(frame.to_text().into())).await.is_err() {
                                    return Resume::Connect;
                                }
                            }
                        }
                        Some(Command::Publish { destination, body }) => {
                            let frame = ClientFrame::send(&destination, body);
                            if ws_tx.send(Message::Text(frame.to_text().into())).await.is_err() {
                                return Resume::Connect;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Route one inbound broker frame. Message bodies that fail JSON
    /// decoding are delivered raw; frames that cannot be routed at all
    /// are dropped with a debug log.
    fn handle_frame(&self, text: &str) {
        let frame: BrokerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "undecodable broker frame");
                return;
            }
        };
        if frame.op != OP_MESSAGE {
            return;
        }
        let message: MessagePayload = match serde_json::from_value(frame.d) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "broker message without destination");
                return;
            }
        };
        self.registry
            .dispatch(&message.destination, Payload::decode(message.body));
    }

    /// Wait out a reconnect backoff while still honoring commands.
    async fn backoff(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        duration: Duration,
    ) -> Resume {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Resume::Connect,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Terminate) => return Resume::Terminate,
                    Some(Command::Recycle) => return Resume::Connect,
                    // Bind stays pending until the next connect; a publish
                    // while disconnected is silently dropped.
                    Some(Command::Bind(_)) | Some(Command::Unsubscribe { .. }) => {}
                    Some(Command::Publish { destination, .. }) => {
                        tracing::debug!(%destination, "publish dropped while disconnected");
                    }
                },
            }
        }
    }

    /// Park after an abandoned (auth-failed) attempt until something
    /// external reactivates or tears down the connection.
    async fn park(&self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Resume {
        loop {
            match cmd_rx.recv().await {
                None | Some(Command::Terminate) => return Resume::Terminate,
                Some(Command::Recycle) => return Resume::Connect,
                Some(Command::Bind(_)) | Some(Command::Unsubscribe { .. }) => {}
                Some(Command::Publish { destination, .. }) => {
                    tracing::debug!(%destination, "publish dropped while disconnected");
                }
            }
        }
    }

    fn terminate(&self) {
        self.registry.clear();
        let _ = self.state_tx.send(ConnectionState::Terminated);
    }
}
