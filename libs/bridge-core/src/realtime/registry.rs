//! Subscription registry shared between consumer handles and the
//! connection driver.
//!
//! A subscription's callback is retained across reconnects; only its
//! binding state changes. Reconnection logic is a pure pass over this
//! registry, independent of the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A decoded inbound payload.
///
/// Bodies that fail JSON decoding are handed to the subscriber raw —
/// the bridge does not assume every topic speaks JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    /// Decode a message body. A string body is re-parsed as JSON when
    /// possible, otherwise delivered as raw text.
    pub fn decode(body: Value) -> Self {
        match body {
            Value::String(text) => match serde_json::from_str(&text) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Text(text),
            },
            value => Payload::Json(value),
        }
    }
}

/// Subscriber callback invoked for each inbound message.
pub type Callback = Arc<dyn Fn(Payload) + Send + Sync>;

struct Record {
    key: u64,
    destination: String,
    callback: Callback,
    bound: bool,
    cancelled: bool,
}

/// Registry of all subscriptions, pending and live.
#[derive(Default)]
pub struct SubscriptionRegistry {
    records: Mutex<Vec<Record>>,
    next_key: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. It starts unbound (pending) and keeps its
    /// registration position for the life of the subscription.
    pub fn register(&self, destination: impl Into<String>, callback: Callback) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.lock().push(Record {
            key,
            destination: destination.into(),
            callback,
            bound: false,
            cancelled: false,
        });
        key
    }

    /// Cancel a subscription at any state. Returns whether it was bound
    /// at cancellation time, or `None` if the key is unknown or already
    /// cancelled. A cancelled pending record is skipped at flush time.
    pub fn cancel(&self, key: u64) -> Option<bool> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.key == key && !r.cancelled)?;
        record.cancelled = true;
        Some(record.bound)
    }

    /// Destination of a subscription that still needs binding. Returns
    /// `None` for bound, cancelled, or unknown keys, so a bind request
    /// that raced the connect-time flush is a no-op.
    pub fn pending_destination(&self, key: u64) -> Option<String> {
        self.records
            .lock()
            .iter()
            .find(|r| r.key == key && !r.cancelled && !r.bound)
            .map(|r| r.destination.clone())
    }

    /// All unbound, uncancelled subscriptions in registration order.
    /// Cancelled records are purged here — the flush is the one place
    /// that observes the cancellation flag.
    pub fn to_bind(&self) -> Vec<(u64, String)> {
        let mut records = self.records.lock();
        records.retain(|r| !r.cancelled);
        records
            .iter()
            .filter(|r| !r.bound)
            .map(|r| (r.key, r.destination.clone()))
            .collect()
    }

    /// Mark a subscription bound to the active connection.
    pub fn mark_bound(&self, key: u64) {
        if let Some(record) = self.records.lock().iter_mut().find(|r| r.key == key) {
            record.bound = true;
        }
    }

    /// Drop every binding (connection lost). Callbacks and registration
    /// order are retained for the next connect.
    pub fn unbind_all(&self) {
        for record in self.records.lock().iter_mut() {
            record.bound = false;
        }
    }

    /// Deliver a payload to every bound subscriber of `destination`.
    pub fn dispatch(&self, destination: &str, payload: Payload) {
        // Snapshot callbacks so subscriber code runs outside the lock.
        let callbacks: Vec<Callback> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.bound && !r.cancelled && r.destination == destination)
            .map(|r| r.callback.clone())
            .collect();

        for callback in callbacks {
            callback(payload.clone());
        }
    }

    /// Discard everything (full teardown).
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Number of uncancelled subscriptions.
    pub fn len(&self) -> usize {
        self.records.lock().iter().filter(|r| !r.cancelled).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
