//! Keyed single-flight coordination.
//!
//! Ensures at most one concurrent execution of an operation per key.
//! Callers arriving while a flight is in progress attach to the same
//! shared future and receive a clone of its output. The key is removed
//! as soon as the flight resolves so a later call starts a new one.

use std::future::Future;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

/// A map of in-flight operations, one per key.
pub struct SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    inflight: DashMap<K, Shared<BoxFuture<'static, T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` under single-flight semantics for `key`.
    ///
    /// If a flight for `key` is already in progress, the returned future
    /// attaches to it instead of starting a second one; `make` is not
    /// called. The winning flight keeps running even if the caller that
    /// started it is dropped, as long as at least one waiter remains.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let shared = make().boxed().shared();
                slot.insert(shared.clone());
                shared
            }
        };

        let out = flight.clone().await;

        // Remove the key immediately so a future flight is not blocked,
        // but only if it still maps to this flight (a concurrent caller
        // may already have started a newer one).
        self.inflight
            .remove_if(&key, |_, current| current.ptr_eq(&flight));

        out
    }

    /// Number of flights currently in progress.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
