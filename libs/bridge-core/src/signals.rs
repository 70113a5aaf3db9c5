//! UI-facing signal hub.
//!
//! Authentication failures detected anywhere in the bridge funnel into a
//! single signal stream so the UI has one place to react, regardless of
//! which subsystem noticed first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Duplicate auth-expired signals inside this window are suppressed, so
/// a burst of concurrent 401s produces one re-login prompt.
const AUTH_EXPIRED_SUPPRESS_WINDOW: Duration = Duration::from_millis(1500);

const CHANNEL_CAPACITY: usize = 16;

/// Signals delivered to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiSignal {
    /// Authentication is no longer valid; the user must log in again.
    AuthExpired { message: Option<String> },
}

struct Inner {
    sender: broadcast::Sender<UiSignal>,
    last_auth_expired: Mutex<Option<Instant>>,
}

/// Cloneable signal hub. Stored in the bridge context.
#[derive(Clone)]
pub struct UiSignals {
    inner: Arc<Inner>,
}

impl Default for UiSignals {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sender,
                last_auth_expired: Mutex::new(None),
            }),
        }
    }
}

impl UiSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an auth-expired signal. Returns `false` when suppressed by
    /// the duplicate window.
    pub fn auth_expired(&self, message: Option<String>) -> bool {
        let mut last = self.inner.last_auth_expired.lock();
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < AUTH_EXPIRED_SUPPRESS_WINDOW {
                return false;
            }
        }
        *last = Some(now);
        drop(last);

        let _ = self.inner.sender.send(UiSignal::AuthExpired { message });
        true
    }

    /// Subscribe to signals. Each UI consumer holds its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<UiSignal> {
        self.inner.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_of_auth_failures_raises_one_signal() {
        let signals = UiSignals::new();
        let mut rx = signals.subscribe();

        assert!(signals.auth_expired(Some("session expired".into())));
        assert!(!signals.auth_expired(None));
        assert!(!signals.auth_expired(None));

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            UiSignal::AuthExpired {
                message: Some("session expired".into())
            }
        );
        assert!(rx.try_recv().is_err(), "duplicates were not suppressed");
    }

    #[test]
    fn signal_without_subscribers_is_not_an_error() {
        let signals = UiSignals::new();
        assert!(signals.auth_expired(None));
    }
}
