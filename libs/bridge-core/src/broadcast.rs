//! Cross-tab authentication event channel.
//!
//! Mirrors the browser `BroadcastChannel` contract for one origin: every
//! tab opens its own handle on a shared hub, a published event reaches
//! every other tab at most once, and nothing is replayed or echoed back
//! to the publisher. Events are advisory triggers to revalidate, not a
//! source of truth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the hub channel. Slow receivers that fall behind skip
/// events (RecvError::Lagged) — acceptable for advisory triggers.
const CHANNEL_CAPACITY: usize = 64;

/// Auth events exchanged between tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthEvent {
    /// A refresh succeeded somewhere; other tabs should reconcile.
    TokenRefreshed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// The session ended; tabs tear down credentialed state.
    LoggedOut,
    /// A login bypass flow failed; surfaced to whichever tab listens.
    BypassError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    event: AuthEvent,
}

struct Hub {
    sender: broadcast::Sender<Envelope>,
    next_origin: AtomicU64,
}

/// The origin-scoped event hub. Cloneable — store in the bridge context.
#[derive(Clone)]
pub struct AuthBroadcaster {
    hub: Arc<Hub>,
}

impl Default for AuthBroadcaster {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            hub: Arc::new(Hub {
                sender,
                next_origin: AtomicU64::new(1),
            }),
        }
    }
}

impl AuthBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tab-local handle on the hub. Each handle has its own
    /// identity; events it publishes are not delivered back to its own
    /// subscribers.
    pub fn open(&self) -> AuthChannel {
        AuthChannel {
            origin: self.hub.next_origin.fetch_add(1, Ordering::Relaxed),
            hub: self.hub.clone(),
        }
    }
}

/// A tab's handle on the auth event hub.
#[derive(Clone)]
pub struct AuthChannel {
    origin: u64,
    hub: Arc<Hub>,
}

impl AuthChannel {
    /// Publish an event to every other tab. A send with no listeners is
    /// not an error.
    pub fn publish(&self, event: AuthEvent) {
        let _ = self.hub.sender.send(Envelope {
            origin: self.origin,
            event,
        });
    }

    /// Subscribe to events published by other tabs. Dropping the returned
    /// stream closes this subscription only.
    pub fn subscribe(&self) -> AuthEvents {
        AuthEvents {
            origin: self.origin,
            rx: self.hub.sender.subscribe(),
        }
    }
}

/// Stream of auth events from other tabs.
pub struct AuthEvents {
    origin: u64,
    rx: broadcast::Receiver<Envelope>,
}

impl AuthEvents {
    /// Receive the next event. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.recv().await {
                // Own events are filtered out, matching BroadcastChannel.
                Ok(env) if env.origin == self.origin => continue,
                Ok(env) => return Some(env.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "auth event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
