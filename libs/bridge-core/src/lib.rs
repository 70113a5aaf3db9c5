//! Session bridge core: keeps a short-lived access credential valid
//! across a reverse-proxy gateway, a shared realtime connection, and
//! multiple same-origin tabs, without duplicate refresh calls or
//! orphaned subscriptions.
//!
//! ## Core types
//!
//! - [`CredentialStore`] / [`Credential`] — in-memory token cell
//! - [`RefreshOrchestrator`] — single-flight credential refresh
//! - [`AuthBroadcaster`] / [`AuthEvent`] — cross-tab auth events
//! - [`RealtimeConnectionManager`] — shared duplex connection with
//!   reconnect-surviving subscriptions
//! - [`AckCoalescer`] — debounced, idempotent read acknowledgments
//! - [`SessionBridge`] — the application-root context wiring it together

pub mod ack;
pub mod broadcast;
pub mod config;
pub mod credentials;
pub mod error;
pub mod realtime;
pub mod refresh;
pub mod signals;
pub mod singleflight;

use std::sync::Arc;
use std::time::Duration;

pub use ack::{AckCoalescer, AckOutcome, AckUpdate, AckWriteError, AckWriter, HttpAckWriter};
pub use broadcast::{AuthBroadcaster, AuthChannel, AuthEvent, AuthEvents};
pub use config::BridgeConfig;
pub use credentials::{Credential, CredentialStore};
pub use error::{BridgeError, Result};
pub use realtime::{ConnectionState, Payload, RealtimeConnectionManager, RealtimeOptions, SubscriptionHandle};
pub use refresh::RefreshOrchestrator;
pub use signals::{UiSignal, UiSignals};
pub use singleflight::SingleFlight;

/// The session bridge context for one tab (process).
///
/// Explicitly constructed and owned by the application root; everything
/// mutable lives behind the handles in here rather than in globals.
pub struct SessionBridge {
    config: BridgeConfig,
    store: CredentialStore,
    channel: AuthChannel,
    signals: UiSignals,
    refresher: RefreshOrchestrator,
    realtime: RealtimeConnectionManager,
    acks: AckCoalescer,
}

impl SessionBridge {
    /// Wire up a bridge against a shared origin-scoped broadcaster.
    pub fn new(config: BridgeConfig, broadcaster: &AuthBroadcaster) -> Result<Self> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;

        let store = CredentialStore::new();
        let channel = broadcaster.open();
        let signals = UiSignals::new();

        let refresher = RefreshOrchestrator::new(
            http.clone(),
            config.refresh_url.clone(),
            config.refresh_timeout,
            store.clone(),
            channel.clone(),
        );

        // The manager listens on this tab's own channel handle: events
        // from other tabs steer it, while its own refresher's broadcasts
        // are filtered out (a same-tab refresh already lands in the
        // store the next handshake reads from).
        let realtime = RealtimeConnectionManager::spawn(
            RealtimeOptions {
                url: config.realtime_url.clone(),
                min_ttl: config.min_ttl,
            },
            refresher.clone(),
            signals.clone(),
            channel.subscribe(),
        );

        let acks = AckCoalescer::new(
            Arc::new(HttpAckWriter::new(http, config.gateway_base_url.clone())),
            config.ack_debounce,
        );

        Ok(Self {
            config,
            store,
            channel,
            signals,
            refresher,
            realtime,
            acks,
        })
    }

    /// Return a credential with at least `min_ttl` remaining, refreshing
    /// at most once across all concurrent callers. `None` means "not
    /// authenticated".
    pub async fn ensure_fresh(&self, min_ttl: Duration) -> Option<Credential> {
        self.refresher.ensure_fresh(min_ttl).await
    }

    /// Subscribe a callback to a realtime destination. Queued until the
    /// connection is open; survives reconnects.
    pub fn subscribe(
        &self,
        destination: &str,
        callback: impl Fn(Payload) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.realtime.subscribe(destination, callback)
    }

    /// Best-effort realtime send; a no-op while disconnected.
    pub fn publish(&self, destination: &str, body: serde_json::Value) {
        self.realtime.publish(destination, body)
    }

    /// Record a read position, coalesced per resource.
    pub async fn mark_read(
        &self,
        resource_id: i64,
        update: AckUpdate,
    ) -> std::result::Result<AckOutcome, AckWriteError> {
        self.acks.mark_read(resource_id, update).await
    }

    /// End the session in this tab and announce it to the others.
    ///
    /// The local manager is torn down directly — the broadcast only
    /// reaches other tabs by design.
    pub fn logout(&self) {
        self.store.clear();
        self.realtime.terminate();
        self.channel.publish(AuthEvent::LoggedOut);
    }

    /// Full inbound destination for a topic suffix.
    pub fn topic(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}/{suffix}", self.config.topic_prefix)
    }

    /// Full outbound destination for an application suffix.
    pub fn app(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}/{suffix}", self.config.app_prefix)
    }

    /// UI signal hub (auth-expired prompts).
    pub fn signals(&self) -> &UiSignals {
        &self.signals
    }

    /// Observe the realtime connection state.
    pub fn connection_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.realtime.state()
    }
}
